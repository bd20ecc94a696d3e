use std::{
    fs::File,
    io::{BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use crate::error::PersistenceError;

/// Writes `item` as little-endian f32s.
pub fn write_f32s(item: &[f32], path: impl AsRef<Path>) -> Result<(), PersistenceError> {
    let mut file = BufWriter::new(File::create(path)?);

    for x in item {
        file.write_all(&x.to_le_bytes())?;
    }

    file.flush()?;
    Ok(())
}

/// Reads exactly `expected` little-endian f32s from `path`.
pub fn read_f32s(path: impl AsRef<Path>, expected: usize) -> Result<Vec<f32>, PersistenceError> {
    let path = path.as_ref();

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(PersistenceError::Missing(path.to_path_buf())),
        Err(e) => return Err(e.into()),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() != 4 * expected {
        return Err(PersistenceError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("expected {} bytes, found {}", 4 * expected, buf.len()),
        });
    }

    Ok(buf.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect())
}

/// Euclidean norm of a flat buffer.
pub fn l2_norm(xs: &[f32]) -> f32 {
    xs.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_is_checked_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");

        write_f32s(&[1.0, -2.5, 3.25], &path).unwrap();
        assert_eq!(read_f32s(&path, 3).unwrap(), vec![1.0, -2.5, 3.25]);
        assert!(matches!(read_f32s(&path, 4), Err(PersistenceError::Corrupt { .. })));
        assert!(matches!(read_f32s(dir.path().join("nope.bin"), 3), Err(PersistenceError::Missing(_))));
    }
}
