use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use super::error::{FileSourceError, TrainFormatError};
use super::train_buffer::{Layout, TrainBuffer};

/// Marker every train file name must contain
pub const TRAIN_FILE_MARKER: &str = "TrainData";

/// A train file holds one assembled train, header to train trailer, exactly as the
/// Receiver stores it.
pub fn write_train_file(path: &Path, train: &TrainBuffer) -> Result<(), FileSourceError> {
    if train.layout() == Layout::Pixel {
        return Err(FileSourceError::BadTrainFile(
            path.to_path_buf(),
            TrainFormatError::UnsupportedConversion {
                from: Layout::Pixel.to_string(),
                to: Layout::Image.to_string(),
            },
        ));
    }
    let len = train.format().total_bytes();
    write_train_bytes(path, &train.as_bytes()[..len])
}

pub fn write_train_bytes(path: &Path, bytes: &[u8]) -> Result<(), FileSourceError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

/// Load a train file into `buffer` and parse it. The buffer is invalid on error.
pub fn read_train_file(
    path: &Path,
    buffer: &mut TrainBuffer,
    asics: &[usize],
) -> Result<(), FileSourceError> {
    buffer.invalidate();
    let mut file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len > buffer.capacity_bytes() {
        return Err(FileSourceError::BadTrainFile(
            path.to_path_buf(),
            TrainFormatError::CapacityTooSmall(buffer.capacity_bytes(), buffer.depth()),
        ));
    }
    file.read_exact(&mut buffer.as_bytes_mut()[..len])?;
    buffer
        .parse(len, asics)
        .map_err(|e| FileSourceError::BadTrainFile(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TrainGenerator;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_TrainData_0001.raw");
        let generator = TrainGenerator::new(2, vec![4]);
        let mut buffer = TrainBuffer::new(2);
        let len = generator.write_train(17, buffer.as_bytes_mut());
        buffer.parse(len, &[4]).unwrap();
        write_train_file(&path, &buffer).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, len);

        let mut loaded = TrainBuffer::new(2);
        read_train_file(&path, &mut loaded, &[4]).unwrap();
        assert_eq!(loaded.train_id(), 17);
        assert_eq!(loaded.data(), buffer.data());
    }

    #[test]
    fn test_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("TrainData_garbage");
        write_train_bytes(&garbage, &[1, 2, 3, 4]).unwrap();
        let mut buffer = TrainBuffer::new(2);
        assert!(matches!(
            read_train_file(&garbage, &mut buffer, &[0]),
            Err(FileSourceError::BadTrainFile(..))
        ));

        let generator = TrainGenerator::new(2, vec![0]);
        let bytes = generator.train_bytes(1);
        let short = dir.path().join("TrainData_short");
        write_train_bytes(&short, &bytes[..bytes.len() - 100]).unwrap();
        assert!(matches!(
            read_train_file(&short, &mut buffer, &[0]),
            Err(FileSourceError::BadTrainFile(_, TrainFormatError::Truncated { .. }))
        ));
        assert!(read_train_file(&dir.path().join("missing"), &mut buffer, &[0]).is_err());
    }
}
