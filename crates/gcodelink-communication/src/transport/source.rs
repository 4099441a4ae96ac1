//! Bulk command sources
//!
//! A stream reads its commands from a restartable [`CommandSource`]. The
//! session rewinds the source when a stream starts, then pulls lines one at a
//! time as the flow gate opens.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Sequential, restartable source of command lines
pub trait CommandSource: Send {
    /// Next raw line, `None` when exhausted
    fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Go back to the first line
    fn rewind(&mut self) -> io::Result<()>;

    /// Total number of lines, when known
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// In-memory source
#[derive(Debug, Clone, Default)]
pub struct LineSource {
    lines: Vec<String>,
    position: usize,
}

impl LineSource {
    /// Create a source over the given lines
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            position: 0,
        }
    }
}

impl CommandSource for LineSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let line = self.lines.get(self.position).cloned();
        if line.is_some() {
            self.position += 1;
        }
        Ok(line)
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.position = 0;
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.lines.len() as u64)
    }
}

/// G-code file on disk
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    total_lines: u64,
}

impl FileSource {
    /// Open a file and count its lines
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut total_lines = 0;
        let mut buf = Vec::new();
        while reader.read_until(b'\n', &mut buf)? > 0 {
            total_lines += 1;
            buf.clear();
        }
        reader.seek(SeekFrom::Start(0))?;

        tracing::debug!("Opened {} ({} lines)", path.display(), total_lines);
        Ok(Self {
            path,
            reader,
            total_lines,
        })
    }

    /// Path of the file being streamed
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandSource for FileSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        if self.reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.total_lines)
    }
}

/// How far a stream has read into its source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    /// Source lines consumed, including blank and comment-only ones
    pub lines_read: u64,
    /// Lines in the source, zero when unknown
    pub total_lines: u64,
}

impl StreamProgress {
    /// Start tracking a source of the given length
    pub fn new(total_lines: u64) -> Self {
        Self {
            lines_read: 0,
            total_lines,
        }
    }

    /// Completion in percent, `None` when the total is unknown
    pub fn percent(&self) -> Option<f64> {
        (self.total_lines > 0)
            .then(|| 100.0 * self.lines_read.min(self.total_lines) as f64 / self.total_lines as f64)
    }

    /// Text progress bar `[####....] 42.0%`, empty when the total is unknown
    pub fn render_bar(&self, width: usize) -> String {
        let Some(percent) = self.percent() else {
            return String::new();
        };
        let filled = ((width as f64) * percent / 100.0).floor() as usize;
        format!(
            "[{}{}] {:.1}%",
            "#".repeat(filled),
            ".".repeat(width - filled.min(width)),
            percent
        )
    }
}
