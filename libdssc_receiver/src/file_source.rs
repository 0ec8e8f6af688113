use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::buffer_pool::BufferPool;
use super::error::FileSourceError;
use super::status::Counters;
use super::stop::StopSignal;
use super::train_file::{read_train_file, TRAIN_FILE_MARKER};

/// Consumed train files are moved here, below the source directory
pub const DONE_DIR: &str = "done";
/// Malformed train files are moved here
pub const REJECTED_DIR: &str = "rejected";

/// The stack of train files waiting in a directory.
///
/// Files are taken oldest first. When the stack runs empty the directory is scanned
/// again, so files written while the stack is being consumed are picked up as well.
/// Consumed files leave the directory, which keeps them from being scanned twice. Files
/// that cannot be moved are remembered and skipped instead.
#[derive(Debug)]
pub struct TrainFileStack {
    pub file_stack: VecDeque<PathBuf>,
    pub total_stack_size_bytes: u64,
    parent_path: PathBuf,
    skipped: HashSet<PathBuf>,
    files_taken: u64,
    max_files: u64,
}

impl TrainFileStack {
    /// Create a stack for `path`. `max_files` of 0 means no limit.
    pub fn new(path: &Path, max_files: u64) -> Result<Self, FileSourceError> {
        if !path.is_dir() {
            return Err(FileSourceError::BadDirectory(path.to_path_buf()));
        }
        std::fs::create_dir_all(path.join(DONE_DIR))?;
        std::fs::create_dir_all(path.join(REJECTED_DIR))?;
        let mut stack = Self {
            file_stack: VecDeque::new(),
            total_stack_size_bytes: 0,
            parent_path: path.to_path_buf(),
            skipped: HashSet::new(),
            files_taken: 0,
            max_files,
        };
        stack.scan()?;
        Ok(stack)
    }

    /// Put every train file of the directory on the stack, oldest first
    fn scan(&mut self) -> Result<usize, FileSourceError> {
        let mut file_list: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
        for item in self.parent_path.read_dir()? {
            let item = item?;
            let metadata = item.metadata()?;
            let item_path = item.path();
            let is_train_file = item_path
                .file_name()
                .map(|name| name.to_string_lossy().contains(TRAIN_FILE_MARKER))
                .unwrap_or(false);
            if metadata.is_file() && is_train_file && !self.skipped.contains(&item_path) {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                file_list.push((modified, item_path, metadata.len()));
            }
        }
        file_list.sort();
        let found = file_list.len();
        for (_, path, size) in file_list {
            self.total_stack_size_bytes += size;
            self.file_stack.push_back(path);
        }
        if found > 0 {
            log::info!(
                "Found {found} train files in {} ({} total)",
                self.parent_path.display(),
                human_bytes::human_bytes(self.total_stack_size_bytes as f64)
            );
        }
        Ok(found)
    }

    pub fn files_taken(&self) -> u64 {
        self.files_taken
    }

    /// Next file to read. None once the directory holds no more train files or the file
    /// limit is reached.
    pub fn next_file(&mut self) -> Result<Option<PathBuf>, FileSourceError> {
        if self.max_files > 0 && self.files_taken >= self.max_files {
            return Ok(None);
        }
        if self.file_stack.is_empty() {
            self.scan()?;
        }
        match self.file_stack.pop_front() {
            Some(path) => {
                self.files_taken += 1;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    fn move_into(&self, file: &Path, dir: &str) -> Result<PathBuf, FileSourceError> {
        let name = file
            .file_name()
            .ok_or_else(|| FileSourceError::BadDirectory(file.to_path_buf()))?;
        let target = self.parent_path.join(dir).join(name);
        std::fs::rename(file, &target)?;
        Ok(target)
    }

    pub fn mark_done(&self, file: &Path) -> Result<PathBuf, FileSourceError> {
        self.move_into(file, DONE_DIR)
    }

    pub fn mark_rejected(&self, file: &Path) -> Result<PathBuf, FileSourceError> {
        self.move_into(file, REJECTED_DIR)
    }

    /// Never take `file` again, for files that could not be moved out of the directory
    pub fn skip(&mut self, file: &Path) {
        self.skipped.insert(file.to_path_buf());
    }

    /// Move a file that could not be read to `rejected/`. If even that fails the file is
    /// left in place and skipped from now on.
    fn reject(&mut self, file: &Path) {
        if let Err(e) = self.mark_rejected(file) {
            log::error!("Could not move {} aside: {e}", file.display());
            self.skip(file);
        }
    }
}

/// Read every train file of `stack` into buffers of `pool` and publish them.
///
/// Files that cannot be read, malformed or not, are counted, moved aside and skipped;
/// reading continues with the next file. Returns the number of trains published.
pub fn read_train_files(
    stack: &mut TrainFileStack,
    pool: &BufferPool,
    asics: &[usize],
    counters: &Counters,
    stop: &StopSignal,
) -> Result<u64, FileSourceError> {
    let mut published = 0;
    while !stop.is_stopped() {
        let Some(path) = stack.next_file()? else {
            break;
        };
        let Some(mut handle) = pool.take_free() else {
            break;
        };
        if let Err(e) = read_train_file(&path, &mut handle, asics) {
            log::warn!("Rejecting train file {}: {e}", path.display());
            Counters::incr(&counters.files_rejected);
            pool.release(handle)?;
            stack.reject(&path);
            continue;
        }
        log::debug!("Read train {} from {}", handle.train_id(), path.display());
        Counters::incr(&counters.received_trains);
        Counters::incr(&counters.files_read);
        pool.publish(handle)?;
        published += 1;
        if let Err(e) = stack.mark_done(&path) {
            log::error!("Could not move {} to {DONE_DIR}: {e}", path.display());
            stack.skip(&path);
        }
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PoolPolicy;
    use crate::generator::TrainGenerator;
    use crate::train_file::write_train_bytes;

    #[test]
    fn test_bad_directory() {
        assert!(matches!(
            TrainFileStack::new(Path::new("/does/not/exist"), 0),
            Err(FileSourceError::BadDirectory(_))
        ));
    }

    #[test]
    fn test_reads_and_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TrainGenerator::new(1, vec![0]);
        for id in 1..=3u64 {
            let path = dir.path().join(format!("run1_TrainData_{id:04}.raw"));
            write_train_bytes(&path, &generator.train_bytes(id)).unwrap();
        }
        write_train_bytes(&dir.path().join("run1_TrainData_bad.raw"), &[0; 16]).unwrap();
        write_train_bytes(&dir.path().join("notes.txt"), b"not a train").unwrap();

        let pool = BufferPool::new("files", 4, 1, PoolPolicy::Block).unwrap();
        let counters = Counters::new();
        let mut stack = TrainFileStack::new(dir.path(), 0).unwrap();
        assert_eq!(stack.file_stack.len(), 4);
        let published =
            read_train_files(&mut stack, &pool, &[0], &counters, &StopSignal::new()).unwrap();
        assert_eq!(published, 3);
        assert_eq!(pool.ready_len(), 3);

        let mut ids: Vec<u64> = (0..3).map(|_| pool.take_ready().unwrap().train_id()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(dir.path().join(DONE_DIR).read_dir().unwrap().count(), 3);
        assert_eq!(dir.path().join(REJECTED_DIR).read_dir().unwrap().count(), 1);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(
            counters.files_rejected.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_file_limit_and_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TrainGenerator::new(1, vec![0]);
        let write = |id: u64| {
            let path = dir.path().join(format!("TrainData_{id}"));
            write_train_bytes(&path, &generator.train_bytes(id)).unwrap();
        };
        write(1);
        let mut stack = TrainFileStack::new(dir.path(), 2).unwrap();
        let first = stack.next_file().unwrap().unwrap();
        stack.mark_done(&first).unwrap();
        // written after the first scan
        write(2);
        write(3);
        assert!(stack.next_file().unwrap().is_some());
        assert!(stack.next_file().unwrap().is_none());
        assert_eq!(stack.files_taken(), 2);
    }

    #[test]
    fn test_vanished_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TrainGenerator::new(1, vec![0]);
        for id in 1..=3u64 {
            let path = dir.path().join(format!("TrainData_{id}"));
            write_train_bytes(&path, &generator.train_bytes(id)).unwrap();
        }
        let pool = BufferPool::new("files", 4, 1, PoolPolicy::Block).unwrap();
        let counters = Counters::new();
        let mut stack = TrainFileStack::new(dir.path(), 0).unwrap();
        // removed after the scan
        std::fs::remove_file(dir.path().join("TrainData_1")).unwrap();

        let published =
            read_train_files(&mut stack, &pool, &[0], &counters, &StopSignal::new()).unwrap();
        assert_eq!(published, 2);
        let ids: Vec<u64> = (0..2).map(|_| pool.take_ready().unwrap().train_id()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(
            counters.files_rejected.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(dir.path().join(DONE_DIR).read_dir().unwrap().count(), 2);
    }

    #[test]
    fn test_unmovable_file_is_not_read_twice() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TrainGenerator::new(1, vec![0]);
        write_train_bytes(&dir.path().join("TrainData_1"), &[0; 16]).unwrap();
        write_train_bytes(&dir.path().join("TrainData_2"), &generator.train_bytes(2)).unwrap();
        let pool = BufferPool::new("files", 2, 1, PoolPolicy::Block).unwrap();
        let counters = Counters::new();
        let mut stack = TrainFileStack::new(dir.path(), 0).unwrap();
        // rejected/ is gone, so the malformed file stays where it is
        std::fs::remove_dir(dir.path().join(REJECTED_DIR)).unwrap();

        let published =
            read_train_files(&mut stack, &pool, &[0], &counters, &StopSignal::new()).unwrap();
        assert_eq!(published, 1);
        assert!(dir.path().join("TrainData_1").exists());
        assert_eq!(
            counters.files_rejected.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
