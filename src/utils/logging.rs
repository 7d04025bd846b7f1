use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::core::message::{Message, Role};

const USER_PREFIX: &str = "You";

/// Plain-text transcript of a chat, written as turns resolve.
pub struct TranscriptLog {
    file_path: PathBuf,
}

impl TranscriptLog {
    /// Opens `path` for appending, creating it when needed.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let file_path = path.into();
        // Fail early when the file cannot be written.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        Ok(Self { file_path })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Appends the rendering of each message in `messages`.
    pub fn append(&self, messages: &[Message]) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        for message in messages {
            write_message(&mut writer, message)?;
        }
        writer.flush()
    }

    /// Replaces the file with the rendering of `messages`. Used after a
    /// regeneration dropped turns that were already logged.
    pub fn rewrite(&self, messages: &[Message]) -> io::Result<()> {
        let parent = self
            .file_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Same directory so the final rename stays atomic.
        let mut temp_file = NamedTempFile::new_in(parent)?;
        for message in messages {
            write_message(&mut temp_file, message)?;
        }
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&self.file_path)
            .map_err(|err| err.error)?;
        Ok(())
    }
}

fn write_message(writer: &mut impl Write, message: &Message) -> io::Result<()> {
    let rendered = match message.role {
        Role::User => format!("{USER_PREFIX}: {}", message.text()),
        Role::Assistant if message.error => format!("## Error: {}", message.text()),
        Role::Assistant => {
            let mut rendered = message.text();
            for (_, name, _) in message.tool_calls() {
                if !rendered.is_empty() {
                    rendered.push('\n');
                }
                rendered.push_str(&format!("## Tool call: {name}"));
            }
            rendered
        }
        // Tool payloads stay out of the transcript.
        Role::Tool => return Ok(()),
    };
    if rendered.is_empty() {
        return Ok(());
    }
    for line in rendered.lines() {
        writeln!(writer, "{line}")?;
    }
    writeln!(writer)
}
