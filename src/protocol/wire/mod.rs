//! Wire encoding for Homa packets.
//!
//! Every multi-byte field of the Homa wire protocol is big-endian. This
//! module defines the `Serialize`/`Deserialize` trait pair used by all
//! on-the-wire data structures, implementations for the primitive field
//! types, and macros that derive the traits for structs (field by field, in
//! declaration order) and for `#[repr(u8)]` discriminant enums.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};

pub mod hdr;

pub use hdr::{
    ack_hdr, busy_hdr, common_hdr, cutoffs_hdr, data_hdr, encode, freeze_hdr, grant_hdr, homa_ack,
    install_checksum, need_ack_hdr, packet_type, parse_packet, resend_hdr, rpc_unknown_hdr,
    verify_checksum, Packet,
};

/// Byte order used for all wire fields.
pub type WireEndian = BigEndian;

/// Serializes the implementing type into the provided writer.
pub trait Serialize {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

/// Deserializes data from the provided reader into the implementing type,
/// replacing its current contents.
pub trait Deserialize {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Reads a `T` from `src`, starting from `T::default()`.
pub fn deserialize<T: Deserialize + Default>(src: &mut impl Read) -> std::io::Result<T> {
    let mut value = T::default();
    value.deserialize(src)?;
    Ok(value)
}

/// Builds an `InvalidData` error for malformed wire input.
pub fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m.to_string())
}

impl Serialize for u8 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u8(*self)
    }
}

impl Deserialize for u8 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u8()?;
        Ok(())
    }
}

impl Serialize for u16 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u16::<WireEndian>(*self)
    }
}

impl Deserialize for u16 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u16::<WireEndian>()?;
        Ok(())
    }
}

impl Serialize for u32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<WireEndian>(*self)
    }
}

impl Deserialize for u32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<WireEndian>()?;
        Ok(())
    }
}

impl Serialize for u64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u64::<WireEndian>(*self)
    }
}

impl Deserialize for u64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u64::<WireEndian>()?;
        Ok(())
    }
}

/// Fixed-size byte arrays are written raw, without a length prefix. Used for
/// header padding.
impl<const N: usize> Serialize for [u8; N] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_all(self)
    }
}

impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        src.read_exact(self)
    }
}

/// Fixed arrays of `u32` are written element by element, no prefix. Used for
/// the CUTOFFS priority table.
impl<const N: usize> Serialize for [u32; N] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        for v in self {
            v.serialize(dest)?;
        }
        Ok(())
    }
}

impl<const N: usize> Deserialize for [u32; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        for v in self.iter_mut() {
            v.deserialize(src)?;
        }
        Ok(())
    }
}

/// Implements `Serialize` for a struct by serializing each named field in
/// sequence.
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Serialize for $t {
            fn serialize<W: std::io::Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements `Deserialize` for a struct by deserializing each named field
/// in sequence.
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Deserialize for $t {
            fn deserialize<R: std::io::Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

/// Implements `Serialize` for a `#[repr(u8)]` enum as its discriminant byte.
#[macro_export]
macro_rules! SerializeEnum {
    ($t:ident) => {
        impl Serialize for $t {
            fn serialize<W: std::io::Write>(&self, dest: &mut W) -> std::io::Result<()> {
                (*self as u8).serialize(dest)
            }
        }
    };
}

/// Implements `Deserialize` for a `#[repr(u8)]` enum, rejecting unknown
/// discriminants with `InvalidData`.
#[macro_export]
macro_rules! DeserializeEnum {
    ($t:ident) => {
        impl Deserialize for $t {
            fn deserialize<R: std::io::Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                let raw: u8 = $crate::wire::deserialize(src)?;
                if let Some(p) = FromPrimitive::from_u8(raw) {
                    *self = p;
                } else {
                    return Err($crate::wire::invalid_data(&format!(
                        "invalid value {} for {}",
                        raw,
                        stringify!($t)
                    )));
                }
                Ok(())
            }
        }
    };
}

// Re-export for use in sibling modules.
pub use crate::DeserializeEnum;
pub use crate::DeserializeStruct;
pub use crate::SerializeEnum;
pub use crate::SerializeStruct;
