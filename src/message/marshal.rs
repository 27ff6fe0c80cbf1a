//! Endian-aware reader/writer for the framed wire format.
//!
//! Only the fixed header layout and the header-field array are marshalled
//! here; message bodies stay opaque bytes described by their signature.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::{
    names::validate_signature,
    utils::padding_for_n_bytes,
    Error, Result,
};

use super::header::EndianSig;

/// Concrete byte order of one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl From<EndianSig> for Endian {
    fn from(sig: EndianSig) -> Self {
        match sig {
            EndianSig::Little => Endian::Little,
            EndianSig::Big => Endian::Big,
        }
    }
}

impl From<Endian> for EndianSig {
    fn from(endian: Endian) -> Self {
        match endian {
            Endian::Little => EndianSig::Little,
            Endian::Big => EndianSig::Big,
        }
    }
}

#[cfg(target_endian = "little")]
pub const NATIVE_ENDIAN: Endian = Endian::Little;
#[cfg(target_endian = "big")]
pub const NATIVE_ENDIAN: Endian = Endian::Big;

/// Alignment of a single complete type, keyed by its leading type code.
pub(crate) fn alignment_of(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Writer appending marshalled values to a byte vector.
#[derive(Debug)]
pub(crate) struct Writer {
    buf: Vec<u8>,
    endian: Endian,
}

impl Writer {
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Zero-pad up to the next multiple of `align`.
    pub fn align(&mut self, align: usize) {
        let padding = padding_for_n_bytes(self.buf.len(), align);
        self.buf.extend(std::iter::repeat(0).take(padding));
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u32(&mut self, val: u32) {
        self.align(4);
        let mut scratch = [0u8; 4];
        match self.endian {
            Endian::Little => LittleEndian::write_u32(&mut scratch, val),
            Endian::Big => BigEndian::write_u32(&mut scratch, val),
        }
        self.buf.extend_from_slice(&scratch);
    }

    /// Patch a `u32` previously written at `offset`.
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        let slot = &mut self.buf[offset..offset + 4];
        match self.endian {
            Endian::Little => LittleEndian::write_u32(slot, val),
            Endian::Big => BigEndian::write_u32(slot, val),
        }
    }

    /// A string marshalled as `s` or `o`: u32 length, bytes, nul.
    pub fn write_string(&mut self, val: &str) {
        self.write_u32(val.len() as u32);
        self.buf.extend_from_slice(val.as_bytes());
        self.buf.push(0);
    }

    /// A signature marshalled as `g`: u8 length, bytes, nul.
    pub fn write_signature_str(&mut self, val: &str) {
        self.write_u8(val.len() as u8);
        self.buf.extend_from_slice(val.as_bytes());
        self.buf.push(0);
    }
}

/// Reader consuming marshalled values from a byte slice.
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn corrupt(what: &str) -> Error {
        Error::CorruptedMessage(what.to_owned())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Self::corrupt("truncated data"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip padding up to the next multiple of `align`; padding bytes must be
    /// zero.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let padding = padding_for_n_bytes(self.pos, align);
        let bytes = self.take(padding)?;
        if bytes.iter().any(|b| *b != 0) {
            return Err(Self::corrupt("non-zero padding"));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.take(2)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u16(bytes),
            Endian::Big => BigEndian::read_u16(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.take(8)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u64(bytes),
            Endian::Big => BigEndian::read_u64(bytes),
        })
    }

    /// A string marshalled as `s` or `o`.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len + 1)?;
        if bytes[len] != 0 {
            return Err(Self::corrupt("string missing nul terminator"));
        }
        let s = std::str::from_utf8(&bytes[..len])
            .map_err(|_| Self::corrupt("string is not valid UTF-8"))?;
        if s.contains('\0') {
            return Err(Self::corrupt("string contains interior nul"));
        }
        Ok(s)
    }

    /// A signature marshalled as `g`; validated.
    pub fn read_signature_str(&mut self) -> Result<&'a str> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len + 1)?;
        if bytes[len] != 0 {
            return Err(Self::corrupt("signature missing nul terminator"));
        }
        let s = std::str::from_utf8(&bytes[..len])
            .map_err(|_| Self::corrupt("signature is not valid UTF-8"))?;
        validate_signature(s).map_err(|_| Self::corrupt("ill-formed signature"))?;
        Ok(s)
    }

    /// Skip one marshalled value of the given (already validated) signature.
    ///
    /// Used for header fields with unknown codes, whose variant payload must
    /// be stepped over without interpretation.
    pub fn skip_value(&mut self, signature: &str) -> Result<()> {
        let mut sig = signature.as_bytes();
        self.skip_one(&mut sig)?;
        if !sig.is_empty() {
            return Err(Self::corrupt("variant with multiple complete types"));
        }
        Ok(())
    }

    fn skip_one(&mut self, sig: &mut &[u8]) -> Result<()> {
        let (&code, rest) = sig
            .split_first()
            .ok_or_else(|| Self::corrupt("empty signature in variant"))?;
        *sig = rest;

        match code {
            b'y' => {
                self.read_u8()?;
            }
            b'n' | b'q' => {
                self.read_u16()?;
            }
            b'b' => {
                let val = self.read_u32()?;
                if val > 1 {
                    return Err(Self::corrupt("boolean out of range"));
                }
            }
            b'i' | b'u' | b'h' => {
                self.read_u32()?;
            }
            b'x' | b't' | b'd' => {
                self.read_u64()?;
            }
            b's' | b'o' => {
                self.read_string()?;
            }
            b'g' => {
                self.read_signature_str()?;
            }
            b'v' => {
                let inner = self.read_signature_str()?.to_owned();
                self.skip_value(&inner)?;
            }
            b'a' => {
                let len = self.read_u32()? as usize;
                let elem_align = alignment_of(*sig.first().ok_or_else(|| {
                    Self::corrupt("array signature missing element type")
                })?);
                self.align(elem_align)?;
                self.take(len)?;
                // Step over the element type in the signature.
                skip_signature_one(sig).map_err(|_| Self::corrupt("bad array signature"))?;
            }
            b'(' => {
                self.align(8)?;
                while sig.first() != Some(&b')') {
                    self.skip_one(sig)?;
                }
                *sig = &sig[1..];
            }
            b'{' => {
                self.align(8)?;
                self.skip_one(sig)?;
                self.skip_one(sig)?;
                if sig.first() != Some(&b'}') {
                    return Err(Self::corrupt("unterminated dict entry"));
                }
                *sig = &sig[1..];
            }
            _ => return Err(Self::corrupt("unknown type code in variant")),
        }

        Ok(())
    }
}

/// Step over one complete type in a signature without touching wire data.
fn skip_signature_one(sig: &mut &[u8]) -> std::result::Result<(), ()> {
    let (&code, rest) = sig.split_first().ok_or(())?;
    *sig = rest;
    match code {
        b'a' => skip_signature_one(sig),
        b'(' => {
            while sig.first() != Some(&b')') {
                skip_signature_one(sig)?;
            }
            *sig = &sig[1..];
            Ok(())
        }
        b'{' => {
            skip_signature_one(sig)?;
            skip_signature_one(sig)?;
            if sig.first() != Some(&b'}') {
                return Err(());
            }
            *sig = &sig[1..];
            Ok(())
        }
        b')' | b'}' => Err(()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_both_endians() {
        for endian in [Endian::Little, Endian::Big] {
            let mut w = Writer::new(endian);
            w.write_u8(0x17);
            w.write_u32(0xdead_beef);
            let bytes = w.into_bytes();
            // One byte, three padding, four value bytes.
            assert_eq!(bytes.len(), 8);

            let mut r = Reader::new(&bytes, endian);
            assert_eq!(r.read_u8().unwrap(), 0x17);
            assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        }
    }

    #[test]
    fn string_round_trip() {
        let mut w = Writer::new(Endian::Little);
        w.write_string("/org/freedesktop/DBus");
        w.write_signature_str("a{sv}");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes, Endian::Little);
        assert_eq!(r.read_string().unwrap(), "/org/freedesktop/DBus");
        assert_eq!(r.read_signature_str().unwrap(), "a{sv}");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn nonzero_padding_is_corruption() {
        let mut bytes = vec![1u8, 0xff, 0, 0, 4, 0, 0, 0];
        let mut r = Reader::new(&bytes, Endian::Little);
        r.read_u8().unwrap();
        assert!(matches!(
            r.read_u32(),
            Err(Error::CorruptedMessage(_))
        ));

        bytes[1] = 0;
        let mut r = Reader::new(&bytes, Endian::Little);
        r.read_u8().unwrap();
        assert_eq!(r.read_u32().unwrap(), 4);
    }

    #[test]
    fn skip_values_of_various_types() {
        let mut w = Writer::new(Endian::Little);
        // (u)
        w.align(8);
        w.write_u32(7);
        // as: ["hi", "yo"]
        let arr_len_at = {
            w.write_u32(0); // placeholder
            w.len() - 4
        };
        let start = w.len();
        w.write_string("hi");
        w.write_string("yo");
        let arr_len = (w.len() - start) as u32;
        w.patch_u32(arr_len_at, arr_len);
        // trailing marker
        w.write_u8(0x42);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes, Endian::Little);
        r.skip_value("(u)").unwrap();
        r.skip_value("as").unwrap();
        assert_eq!(r.read_u8().unwrap(), 0x42);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncation_is_detected() {
        let mut w = Writer::new(Endian::Little);
        w.write_string("hello");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes[..bytes.len() - 2], Endian::Little);
        assert!(r.read_string().is_err());
    }
}
