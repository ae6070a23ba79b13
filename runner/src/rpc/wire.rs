use super::RpcError;
use crate::membership::WorkerId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};

/// upper bound for a single frame, protects against garbage length prefixes
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// First framed message of a worker after its cookie was accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    pub pid: u32,
    pub hostname: String,
}

/// Answer of the controller to `Hello`, carries the id assigned to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Welcome {
    pub worker: WorkerId,
}

/// Write one frame: 4 byte big endian length followed by a YAML document
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), RpcError> {
    let document = serde_yaml::to_string(message)?;
    let length = u32::try_from(document.len())
        .ok()
        .filter(|length| *length <= MAX_FRAME_LEN)
        .ok_or(RpcError::FrameTooLarge(document.len()))?;

    writer.write_all(&length.to_be_bytes())?;
    writer.write_all(document.as_bytes())?;
    writer.flush()?;

    Ok(())
}

/// Read one frame written by `write_frame`
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, RpcError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;

    let length = u32::from_be_bytes(prefix);

    if length > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(length as usize));
    }

    let mut document = vec![0u8; length as usize];
    reader.read_exact(&mut document)?;

    Ok(serde_yaml::from_slice(&document)?)
}
