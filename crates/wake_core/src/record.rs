//! Binary wake-shape record used for restart and visualization files.
//!
//! Little-endian layout, one record per trail:
//!
//! ```text
//! i32   node id of the trailing-edge node
//! f64   span fraction of the trailing-edge node
//! i32   node count n
//! n x   (f64 x, f64 y, f64 z)
//! ```

use crate::error::{WakeError, WakeResult};
use nalgebra::Vector3;
use std::io::{Error, ErrorKind, Read, Write};

/// Nodes reserved before reading; longer records grow as they are read.
const PREALLOCATED_NODES: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct WakeRecord {
    pub node_id: i32,
    pub span_fraction: f64,
    pub nodes: Vec<Vector3<f64>>,
}

impl WakeRecord {
    pub fn write<W: Write>(&self, writer: &mut W) -> WakeResult<()> {
        let count = i32::try_from(self.nodes.len()).map_err(|_| {
            Error::new(ErrorKind::InvalidInput, "too many wake nodes for one record")
        })?;
        writer.write_all(&self.node_id.to_le_bytes())?;
        writer.write_all(&self.span_fraction.to_le_bytes())?;
        writer.write_all(&count.to_le_bytes())?;
        for node in &self.nodes {
            for value in node.iter() {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> WakeResult<Self> {
        Self::read_limited(reader, None)
    }

    /// Like [`WakeRecord::read`], but rejects a record holding more than
    /// `capacity` nodes before reading any of them.
    pub fn read_bounded<R: Read>(reader: &mut R, capacity: usize) -> WakeResult<Self> {
        Self::read_limited(reader, Some(capacity))
    }

    fn read_limited<R: Read>(reader: &mut R, capacity: Option<usize>) -> WakeResult<Self> {
        let node_id = read_i32(reader)?;
        let span_fraction = read_f64(reader)?;
        let count = read_count(reader)?;
        if let Some(capacity) = capacity.filter(|&capacity| count > capacity) {
            return Err(WakeError::RecordSizeMismatch {
                found: count,
                capacity,
            });
        }
        let mut nodes = Vec::with_capacity(count.min(PREALLOCATED_NODES));
        for _ in 0..count {
            let x = read_f64(reader)?;
            let y = read_f64(reader)?;
            let z = read_f64(reader)?;
            nodes.push(Vector3::new(x, y, z));
        }
        Ok(Self {
            node_id,
            span_fraction,
            nodes,
        })
    }

    /// Consumes one record without keeping its contents.
    pub fn skip<R: Read>(reader: &mut R) -> WakeResult<()> {
        read_i32(reader)?;
        read_f64(reader)?;
        let count = read_count(reader)?;
        let mut buf = [0u8; 24];
        for _ in 0..count {
            reader.read_exact(&mut buf)?;
        }
        Ok(())
    }
}

fn read_i32<R: Read>(reader: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_count<R: Read>(reader: &mut R) -> std::io::Result<usize> {
    let count = read_i32(reader)?;
    usize::try_from(count).map_err(|_| {
        Error::new(
            ErrorKind::InvalidData,
            format!("negative wake node count {count}"),
        )
    })
}
