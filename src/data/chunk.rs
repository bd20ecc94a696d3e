//! Binary chunk files of recorded positions.
//!
//! Layout (all integers and floats little endian):
//!
//! | field    | size                 |
//! |----------|----------------------|
//! | magic    | 4 bytes, `GZCK`      |
//! | version  | u32                  |
//! | rows     | u32                  |
//! | cols     | u32                  |
//! | channels | u32                  |
//! | classes  | u32                  |
//! | count    | u64                  |
//!
//! followed by `count` records of `rows * cols * channels` feature bytes, `classes` f32
//! policy values and one f32 outcome.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use super::{BoardShape, DataSet, Position};
use crate::error::ChunkError;

const MAGIC: [u8; 4] = *b"GZCK";
const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub shape: BoardShape,
    pub count: usize,
}

impl ChunkHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());

        let dims = [self.shape.rows, self.shape.cols, self.shape.channels, self.shape.classes];
        for (i, dim) in dims.into_iter().enumerate() {
            let start = 8 + 4 * i;
            buf[start..start + 4].copy_from_slice(&(dim as u32).to_le_bytes());
        }

        buf[24..32].copy_from_slice(&(self.count as u64).to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, ChunkError> {
        if buf[0..4] != MAGIC {
            return Err(ChunkError::BadHeader("missing GZCK magic".to_string()));
        }

        let word = |start: usize| u32::from_le_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]]);

        let version = word(4);
        if version != VERSION {
            return Err(ChunkError::BadHeader(format!("unsupported version {version}")));
        }

        let shape = BoardShape::new(word(8) as usize, word(12) as usize, word(16) as usize, word(20) as usize)
            .map_err(|e| ChunkError::BadHeader(e.to_string()))?;

        let mut count = [0; 8];
        count.copy_from_slice(&buf[24..32]);

        Ok(Self { shape, count: u64::from_le_bytes(count) as usize })
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self, ChunkError> {
        let mut buf = [0; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

/// Size in bytes of one record for the given shape.
pub fn record_size(shape: BoardShape) -> usize {
    shape.input_size() + 4 * shape.classes + 4
}

pub fn encode_record(pos: &Position, shape: BoardShape, out: &mut Vec<u8>) {
    assert_eq!(pos.features.len(), shape.input_size(), "Feature length does not match shape!");
    assert_eq!(pos.policy.len(), shape.classes, "Policy length does not match shape!");

    out.extend_from_slice(&pos.features);
    for p in &pos.policy {
        out.extend_from_slice(&p.to_le_bytes());
    }
    out.extend_from_slice(&pos.outcome.to_le_bytes());
}

pub fn decode_record(bytes: &[u8], shape: BoardShape) -> Position {
    assert_eq!(bytes.len(), record_size(shape));

    let inputs = shape.input_size();
    let float = |start: usize| f32::from_le_bytes([bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]);

    let policy = (0..shape.classes).map(|i| float(inputs + 4 * i)).collect();
    let outcome = float(inputs + 4 * shape.classes);

    Position { features: bytes[..inputs].to_vec(), policy, outcome }
}

pub fn write_chunk(path: impl AsRef<Path>, shape: BoardShape, positions: &[Position]) -> Result<(), ChunkError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&ChunkHeader { shape, count: positions.len() }.to_bytes())?;

    let mut buf = Vec::with_capacity(record_size(shape));
    for pos in positions {
        buf.clear();
        encode_record(pos, shape, &mut buf);
        writer.write_all(&buf)?;
    }

    writer.flush()?;
    Ok(())
}

/// Reads every record of a chunk file into a [`DataSet`].
pub fn read_chunk(path: impl AsRef<Path>) -> Result<DataSet, ChunkError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut reader = BufReader::new(file);
    let header = ChunkHeader::read_from(&mut reader)?;
    let shape = header.shape;

    let body = (header.count as u64).checked_mul(record_size(shape) as u64);
    if body.and_then(|b| b.checked_add(HEADER_SIZE as u64)) != Some(len) {
        return Err(ChunkError::BadHeader(format!(
            "{} records of {} bytes do not fit a {len} byte file",
            header.count,
            record_size(shape)
        )));
    }

    let mut positions = Vec::with_capacity(header.count);
    let mut buf = vec![0; record_size(shape)];
    for _ in 0..header.count {
        reader.read_exact(&mut buf)?;
        positions.push(decode_record(&buf, shape));
    }

    Ok(DataSet::new(shape, positions))
}

/// As [`read_chunk`], failing if the file was written for a different board or move space.
pub fn read_chunk_with_shape(path: impl AsRef<Path>, expected: BoardShape) -> Result<DataSet, ChunkError> {
    let data = read_chunk(path)?;

    if data.shape() != expected {
        return Err(ChunkError::ShapeMismatch { expected: expected.to_string(), found: data.shape().to_string() });
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> BoardShape {
        BoardShape::new(2, 2, 3, 5).unwrap()
    }

    fn position(seed: u8) -> Position {
        let mut policy = vec![0.0; 5];
        policy[usize::from(seed) % 5] = 1.0;
        Position { features: (0..12).map(|i| (i + seed) % 2).collect(), policy, outcome: f32::from(seed % 2) }
    }

    #[test]
    fn chunk_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train0.chunk");
        let positions: Vec<_> = (0..7).map(position).collect();

        write_chunk(&path, shape(), &positions).unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, HEADER_SIZE + 7 * record_size(shape()));

        let data = read_chunk_with_shape(&path, shape()).unwrap();
        assert_eq!(data.positions(), positions.as_slice());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.chunk");
        std::fs::write(&path, [0u8; 64]).unwrap();

        assert!(matches!(read_chunk(&path), Err(ChunkError::BadHeader(_))));
    }

    #[test]
    fn rejects_wrong_shape_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.chunk");
        let positions: Vec<_> = (0..3).map(position).collect();
        write_chunk(&path, shape(), &positions).unwrap();

        let other = BoardShape::new(2, 2, 3, 6).unwrap();
        assert!(matches!(read_chunk_with_shape(&path, other), Err(ChunkError::ShapeMismatch { .. })));

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(matches!(read_chunk(&path), Err(ChunkError::BadHeader(_))));
    }

    #[test]
    fn rejects_counts_the_file_cannot_hold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.chunk");

        for count in [usize::MAX, 1 << 36, 4] {
            let mut bytes = ChunkHeader { shape: shape(), count }.to_bytes().to_vec();
            encode_record(&position(1), shape(), &mut bytes);
            std::fs::write(&path, &bytes).unwrap();

            assert!(matches!(read_chunk(&path), Err(ChunkError::BadHeader(_))), "count {count}");
        }
    }
}
