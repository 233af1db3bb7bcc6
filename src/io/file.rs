//! Local file backends

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{resolve_seek, InputHandler, OutputHandler, StatKind, Whence};
use crate::error::Result;

/// Reads a local file
pub struct FileInput {
    path: PathBuf,
    file: Option<File>,
    size: i64,
    pos: i64,
}

impl FileInput {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len() as i64;
        tracing::debug!(path = %path.display(), size, "opened file input");
        Ok(Self {
            path,
            file: Some(file),
            size,
            pos: 0,
        })
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            crate::error::AvpipeError::io("file", format!("{} is closed", self.path.display()))
        })
    }
}

impl InputHandler for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file()?.read(buf)?;
        self.pos += n as i64;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = resolve_seek(self.pos, Some(self.size), offset, whence)?;
        if whence == Whence::Size {
            return Ok(target);
        }
        self.file()?.seek(SeekFrom::Start(target as u64))?;
        self.pos = target;
        Ok(target)
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }

    fn size(&self) -> Option<i64> {
        Some(self.size)
    }

    fn stat(&mut self, kind: StatKind, value: i64) -> Result<()> {
        tracing::trace!(path = %self.path.display(), ?kind, value, "input stat");
        Ok(())
    }
}

/// Writes one output file, creating parent directories on demand
pub struct FileOutput {
    path: PathBuf,
    file: Option<File>,
    pos: i64,
    size: i64,
}

impl FileOutput {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            pos: 0,
            size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            crate::error::AvpipeError::io("file", format!("{} is closed", self.path.display()))
        })
    }
}

impl OutputHandler for FileOutput {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file()?.write_all(buf)?;
        self.pos += buf.len() as i64;
        self.size = self.size.max(self.pos);
        Ok(buf.len())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = resolve_seek(self.pos, Some(self.size), offset, whence)?;
        if whence == Whence::Size {
            return Ok(target);
        }
        self.file()?.seek(SeekFrom::Start(target as u64))?;
        self.pos = target;
        Ok(target)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            tracing::debug!(path = %self.path.display(), size = self.size, "closed file output");
        }
        Ok(())
    }

    fn stat(&mut self, kind: StatKind, value: i64) -> Result<()> {
        tracing::trace!(path = %self.path.display(), ?kind, value, "output stat");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_input_read_and_seek() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.bin");
        fs::write(&path, b"0123456789").unwrap();

        let mut input = FileInput::open(&path).unwrap();
        assert_eq!(input.size(), Some(10));

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        assert_eq!(input.seek(-2, Whence::End).unwrap(), 8);
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(input.read(&mut buf).unwrap(), 0);

        // Size probe leaves the cursor alone
        assert_eq!(input.seek(0, Whence::Size).unwrap(), 10);
        assert_eq!(input.seek(0, Whence::Current).unwrap(), 10);
    }

    #[test]
    fn test_file_output_creates_directories_and_patches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("O1").join("out.mp4");

        let mut out = FileOutput::create(&path).unwrap();
        out.write(b"aaaabbbb").unwrap();
        out.seek(0, Whence::Start).unwrap();
        out.write(b"cc").unwrap();
        assert_eq!(out.seek(0, Whence::Size).unwrap(), 8);
        out.close().unwrap();
        out.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"ccaabbbb");
    }
}
