// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::torrent_file::Torrent;

pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Byte-addressed backing store for a torrent's data, addressed by offsets
/// into the torrent's concatenated data stream.
pub trait Storage: Send + Sync {
    fn read<'a>(&'a self, global_offset: u64, length: usize) -> StorageFuture<'a, Vec<u8>>;
    fn write<'a>(&'a self, global_offset: u64, data: &'a [u8]) -> StorageFuture<'a, ()>;
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,            // The full path to the file on the disk.
    pub length: u64,              // The length of the file in bytes.
    pub global_start_offset: u64, // The starting offset of this file within the torrent's complete data stream.
}

/// File layout of a torrent on disk, covering single and multi-file torrents.
#[derive(Debug, Clone)]
pub struct MultiFileInfo {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl MultiFileInfo {
    pub fn new(root_dir: &Path, torrent: &Torrent) -> Self {
        let mut files = Vec::new();
        let mut current_offset = 0;

        for (components, length) in torrent.file_list() {
            let mut full_path = root_dir.to_path_buf();
            for component in &components {
                full_path.push(component);
            }
            files.push(FileInfo {
                path: full_path,
                length,
                global_start_offset: current_offset,
            });
            current_offset += length;
        }

        Self {
            files,
            total_size: current_offset,
        }
    }
}

/// Creates all necessary directories and pre-allocates all files for a torrent.
pub async fn create_and_allocate_files(
    multi_file_info: &MultiFileInfo,
) -> Result<(), StorageError> {
    for file_info in &multi_file_info.files {
        if let Some(parent_dir) = file_info.path.parent() {
            if !try_exists(parent_dir).await? {
                fs::create_dir_all(parent_dir).await?;
            }
        }

        if !try_exists(&file_info.path).await? {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_info.path)
                .await?;
            file.set_len(file_info.length).await?;
        }
    }
    Ok(())
}

pub async fn read_data_from_disk(
    multi_file_info: &MultiFileInfo,
    global_offset: u64,
    bytes_to_read: usize,
) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::with_capacity(bytes_to_read);
    let mut bytes_read = 0;

    if bytes_to_read == 0 {
        return Ok(buffer);
    }

    for file_info in &multi_file_info.files {
        let file_start = file_info.global_start_offset;
        let file_end = file_start + file_info.length;
        let read_start = global_offset + bytes_read as u64;

        if read_start < file_end && read_start >= file_start {
            let local_offset = read_start - file_start;
            let bytes_in_this_file = std::cmp::min(
                (bytes_to_read - bytes_read) as u64,
                file_info.length - local_offset,
            ) as usize;

            let mut file = File::open(&file_info.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;

            let mut temp_buf = vec![0; bytes_in_this_file];
            file.read_exact(&mut temp_buf).await?;
            buffer.extend_from_slice(&temp_buf);
            bytes_read += bytes_in_this_file;

            if bytes_read == bytes_to_read {
                return Ok(buffer);
            }
        }
    }

    Err(StorageError::OutOfBounds {
        offset: global_offset,
        length: bytes_to_read,
    })
}

pub async fn write_data_to_disk(
    multi_file_info: &MultiFileInfo,
    global_offset: u64,
    data_to_write: &[u8],
) -> Result<(), StorageError> {
    let mut bytes_written = 0;
    let data_len = data_to_write.len();

    if data_len == 0 {
        return Ok(());
    }

    for file_info in &multi_file_info.files {
        let file_start = file_info.global_start_offset;
        let file_end = file_start + file_info.length;
        let write_start = global_offset + bytes_written as u64;

        if write_start < file_end && write_start >= file_start {
            let local_offset = write_start - file_start;
            let bytes_in_this_file = std::cmp::min(
                (data_len - bytes_written) as u64,
                file_info.length - local_offset,
            ) as usize;

            let mut file = OpenOptions::new().write(true).open(&file_info.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            file.write_all(&data_to_write[bytes_written..bytes_written + bytes_in_this_file])
                .await?;
            bytes_written += bytes_in_this_file;

            if bytes_written == data_len {
                return Ok(());
            }
        }
    }

    Err(StorageError::OutOfBounds {
        offset: global_offset,
        length: data_len,
    })
}

/// Storage backed by the torrent's files on disk.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    pub layout: MultiFileInfo,
}

impl DiskStorage {
    pub fn new(layout: MultiFileInfo) -> Self {
        Self { layout }
    }
}

impl Storage for DiskStorage {
    fn read<'a>(&'a self, global_offset: u64, length: usize) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(read_data_from_disk(&self.layout, global_offset, length))
    }

    fn write<'a>(&'a self, global_offset: u64, data: &'a [u8]) -> StorageFuture<'a, ()> {
        Box::pin(write_data_to_disk(&self.layout, global_offset, data))
    }
}

/// Fixed-size in-memory storage. Holds the metadata pseudo-file while it is
/// being fetched from peers.
#[derive(Debug)]
pub struct MemoryStorage {
    buffer: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: Mutex::new(vec![0; size]),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buffer: Mutex::new(bytes),
        }
    }

    fn range(len: usize, global_offset: u64, length: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = global_offset as usize;
        match start.checked_add(length) {
            Some(end) if end <= len => Ok(start..end),
            _ => Err(StorageError::OutOfBounds {
                offset: global_offset,
                length,
            }),
        }
    }

    fn read_sync(&self, global_offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let buffer = self.buffer.lock().map_err(|_| poisoned())?;
        let range = Self::range(buffer.len(), global_offset, length)?;
        Ok(buffer[range].to_vec())
    }

    fn write_sync(&self, global_offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut buffer = self.buffer.lock().map_err(|_| poisoned())?;
        let range = Self::range(buffer.len(), global_offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Io(std::io::Error::other("memory storage lock poisoned"))
}

impl Storage for MemoryStorage {
    fn read<'a>(&'a self, global_offset: u64, length: usize) -> StorageFuture<'a, Vec<u8>> {
        let result = self.read_sync(global_offset, length);
        Box::pin(async move { result })
    }

    fn write<'a>(&'a self, global_offset: u64, data: &'a [u8]) -> StorageFuture<'a, ()> {
        let result = self.write_sync(global_offset, data);
        Box::pin(async move { result })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::{Info, InfoFile};

    use tempfile::tempdir;
    use tokio::fs::File;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

    fn torrent_with(files: Vec<InfoFile>, length: i64, name: &str) -> Torrent {
        Torrent {
            info: Info {
                name: name.to_string(),
                piece_length: 16,
                length,
                files,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Helper to create a single-file setup
    fn setup_single_file() -> (tempfile::TempDir, MultiFileInfo) {
        let dir = tempdir().unwrap();
        let torrent = torrent_with(vec![], 100, "single_file.txt");
        let mfi = MultiFileInfo::new(dir.path(), &torrent);
        (dir, mfi)
    }

    /// Helper to create a multi-file setup
    fn setup_multi_file() -> (tempfile::TempDir, MultiFileInfo) {
        let dir = tempdir().unwrap();
        let files = vec![
            InfoFile {
                path: vec!["file_a.txt".to_string()],
                length: 50, // Ends at 49
            },
            InfoFile {
                path: vec!["subdir".to_string(), "file_b.txt".to_string()],
                length: 70, // Starts at 50
            },
        ];
        let torrent = torrent_with(files, 0, "multi_file_torrent");
        let mfi = MultiFileInfo::new(dir.path(), &torrent);
        (dir, mfi)
    }

    #[tokio::test]
    async fn test_multi_file_info_new_single() {
        let (dir, mfi) = setup_single_file();
        assert_eq!(mfi.files.len(), 1);
        assert_eq!(mfi.total_size, 100);
        assert_eq!(mfi.files[0].global_start_offset, 0);
        assert_eq!(mfi.files[0].path, dir.path().join("single_file.txt"));
    }

    #[tokio::test]
    async fn test_multi_file_info_new_multi() {
        let (dir, mfi) = setup_multi_file();
        assert_eq!(mfi.files.len(), 2);
        assert_eq!(mfi.total_size, 120);
        assert_eq!(mfi.files[1].global_start_offset, 50);
        assert_eq!(
            mfi.files[1].path,
            dir.path().join("subdir").join("file_b.txt")
        );
    }

    #[tokio::test]
    async fn test_create_and_allocate_files_multi() {
        let (dir, mfi) = setup_multi_file();
        create_and_allocate_files(&mfi).await.unwrap();

        assert!(tokio::fs::try_exists(dir.path().join("subdir")).await.unwrap());
        let metadata_a = tokio::fs::metadata(&mfi.files[0].path).await.unwrap();
        assert_eq!(metadata_a.len(), 50);
        let metadata_b = tokio::fs::metadata(&mfi.files[1].path).await.unwrap();
        assert_eq!(metadata_b.len(), 70);
    }

    #[tokio::test]
    async fn test_disk_storage_write_read_across_files() {
        let (_dir, mfi) = setup_multi_file(); // FileA: [0-49], FileB: [50-119]
        create_and_allocate_files(&mfi).await.unwrap();
        let storage = DiskStorage::new(mfi.clone());

        // 10 bytes land in file A, 20 bytes in file B
        let write_data: Vec<u8> = (0..30).collect();
        storage.write(40, &write_data).await.unwrap();

        let read_data = storage.read(40, 30).await.unwrap();
        assert_eq!(write_data, read_data);

        let mut file_b = File::open(&mfi.files[1].path).await.unwrap();
        file_b.seek(SeekFrom::Start(0)).await.unwrap();
        let mut buf_b = vec![0; 20];
        file_b.read_exact(&mut buf_b).await.unwrap();
        assert_eq!(buf_b, &write_data[10..30]);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let (_dir, mfi) = setup_single_file(); // total_size = 100
        create_and_allocate_files(&mfi).await.unwrap();

        let res = read_data_from_disk(&mfi, 95, 10).await;
        assert!(matches!(res, Err(StorageError::OutOfBounds { offset: 95, length: 10 })));

        let res_ok = read_data_from_disk(&mfi, 90, 10).await.unwrap();
        assert_eq!(res_ok.len(), 10);
    }

    #[tokio::test]
    async fn test_write_missing_file_is_io_error() {
        let (_dir, mfi) = setup_single_file();
        // Files were never allocated
        let res = write_data_to_disk(&mfi, 0, &[1, 2, 3]).await;
        assert!(matches!(res, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn test_memory_storage_bounds() {
        let storage = MemoryStorage::new(8);
        storage.write(4, &[9, 9, 9, 9]).await.unwrap();
        assert_eq!(storage.read(0, 8).await.unwrap(), vec![0, 0, 0, 0, 9, 9, 9, 9]);
        assert!(matches!(
            storage.write(6, &[1, 2, 3]).await,
            Err(StorageError::OutOfBounds { .. })
        ));
        assert!(storage.read(9, 0).await.is_err());
    }
}
