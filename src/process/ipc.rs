//! Line-oriented reading over child pipes with EINTR handling.

use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::io::OwnedFd;

/// Solver event lines can carry large statistics maps.
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A pipe read end that retries reads interrupted by signals.
///
/// Interrupts are routine here: the ctrl-c handler and the deadline thread
/// both signal while the main thread sits in `read`.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<std::process::ChildStdout> for PipeFd {
    fn from(stdout: std::process::ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
    }
}

impl From<std::process::ChildStderr> for PipeFd {
    fn from(stderr: std::process::ChildStderr) -> Self {
        Self::new(OwnedFd::from(stderr))
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

/// Buffered line reader over a pipe.
///
/// Invalid UTF-8 is replaced rather than treated as an error, so a single
/// garbled line from a child never ends the stream.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    raw: Vec<u8>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            raw: Vec::with_capacity(4096),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.raw.clear();
        if self.reader.read_until(b'\n', &mut self.raw)? == 0 {
            return Ok(None);
        }
        if self.raw.ends_with(b"\n") {
            self.raw.pop();
        }
        if self.raw.ends_with(b"\r") {
            self.raw.pop();
        }
        self.line_buffer.clear();
        self.line_buffer
            .push_str(&String::from_utf8_lossy(&self.raw));
        Ok(Some(&self.line_buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn create_pipe() -> (PipeFd, File) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), File::from(write_fd))
    }

    #[test]
    fn test_line_reader_splits_lines() {
        let (read_fd, mut write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"{\"type\":\"status\"}\n\nlast").unwrap();
        drop(write_fd);

        assert_eq!(reader.read_line().unwrap(), Some("{\"type\":\"status\"}"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), Some("last"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_crlf_handling() {
        let (read_fd, mut write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"line1\r\nline2\n").unwrap();
        drop(write_fd);

        assert_eq!(reader.read_line().unwrap(), Some("line1"));
        assert_eq!(reader.read_line().unwrap(), Some("line2"));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (read_fd, mut write_fd) = create_pipe();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"ok\xff\n").unwrap();
        drop(write_fd);

        let line = reader.read_line().unwrap().unwrap().to_string();
        assert!(line.starts_with("ok"));
        assert_eq!(reader.read_line().unwrap(), None);
    }
}
