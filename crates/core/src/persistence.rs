use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::turn::{Classification, Turn};

/// Tries with a numeric suffix before giving up on a colliding file name.
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to create transcript directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write transcript {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writes transcript snapshots as plain-text files under one directory.
#[derive(Debug, Clone)]
pub struct PersistenceWriter {
    dir: PathBuf,
}

impl PersistenceWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Renders `turns` and writes them to a new file named after the session.
    ///
    /// Never overwrites: the name carries a nanosecond timestamp and a
    /// suffix is added if that still collides.
    pub async fn persist(&self, turns: &[Turn], session_label: &str) -> Result<PathBuf, PersistError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| PersistError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let stem = format!(
            "{}_{}",
            sanitize_label(session_label),
            Utc::now().format("%Y%m%dT%H%M%S%.9fZ")
        );
        let body = render(turns);

        let mut attempt = 0;
        loop {
            let path = if attempt == 0 {
                self.dir.join(format!("{stem}.txt"))
            } else {
                self.dir.join(format!("{stem}-{attempt}.txt"))
            };

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return match write_or_discard(&path, file, body.as_bytes()).await {
                        Ok(()) => {
                            tracing::info!("Saved {} turns to {}", turns.len(), path.display());
                            Ok(path)
                        }
                        Err(source) => Err(PersistError::Write { path, source }),
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(source) => return Err(PersistError::Write { path, source }),
            }
        }
    }
}

/// Writes `body` through `out`. On failure the file at `path` is removed so
/// no partial transcript is left next to the next save.
async fn write_or_discard<W>(path: &Path, mut out: W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        out.write_all(body).await?;
        out.flush().await
    }
    .await;
    if written.is_err() {
        drop(out);
        if let Err(e) = fs::remove_file(path).await {
            tracing::warn!("Could not remove partial transcript {}: {}", path.display(), e);
        }
    }
    written
}

/// Human-readable rendering, one block per turn.
///
/// Only flagged turns get the two extra lines; pending and failed turns
/// look exactly like clean ones.
pub fn render(turns: &[Turn]) -> String {
    let mut out = String::new();
    for (idx, turn) in turns.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{}] {}",
            idx + 1,
            turn.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let _ = writeln!(out, "{}", turn.text());
        if let Classification::Flagged { name, reasoning } = turn.classification() {
            let _ = writeln!(out, "[FALLACY: {name}]");
            let _ = writeln!(out, "Reasoning: {reasoning}");
        }
        out.push('\n');
    }
    out
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::SessionTranscript;
    use chrono::TimeZone;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;

    /// Accepts the open but fails every write, like a full disk.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn sample_transcript() -> SessionTranscript {
        let mut transcript = SessionTranscript::new("demo", 1);
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        transcript.append("Good morning everyone.".to_string(), ts);
        transcript.append(
            "So you're saying we should just abolish all rules?".to_string(),
            ts + chrono::Duration::seconds(4),
        );
        transcript.append("Let me check the numbers.".to_string(), ts + chrono::Duration::seconds(9));
        transcript.resolve(1, Classification::Clean).unwrap();
        transcript
            .resolve(
                2,
                Classification::Flagged {
                    name: "Straw Man".to_string(),
                    reasoning: "Exaggerates the other side's position.".to_string(),
                },
            )
            .unwrap();
        transcript
            .resolve(
                3,
                Classification::Failed {
                    reason: "timeout".to_string(),
                },
            )
            .unwrap();
        transcript
    }

    #[test]
    fn test_render_blocks() {
        let rendered = render(sample_transcript().turns());
        let expected = "\
[1] 2025-03-01T09:00:00.000Z
Good morning everyone.

[2] 2025-03-01T09:00:04.000Z
So you're saying we should just abolish all rules?
[FALLACY: Straw Man]
Reasoning: Exaggerates the other side's position.

[3] 2025-03-01T09:00:09.000Z
Let me check the numbers.

";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_failed_and_pending_render_like_clean() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut a = SessionTranscript::new("a", 1);
        a.append("Same words.".to_string(), ts);
        let pending = render(a.turns());

        a.resolve(
            1,
            Classification::Failed {
                reason: "bad json".to_string(),
            },
        )
        .unwrap();
        let failed = render(a.turns());

        let mut b = SessionTranscript::new("b", 1);
        b.append("Same words.".to_string(), ts);
        b.resolve(1, Classification::Clean).unwrap();

        assert_eq!(pending, failed);
        assert_eq!(failed, render(b.turns()));
    }

    #[tokio::test]
    async fn test_persist_writes_file_in_new_directory() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path().join("nested").join("transcripts"));

        let path = writer
            .persist(sample_transcript().turns(), "demo")
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[FALLACY: Straw Man]\n"));
        assert!(content.contains("Reasoning: Exaggerates the other side's position.\n"));
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("demo_") && name.ends_with(".txt"), "{name}");
    }

    #[tokio::test]
    async fn test_persist_empty_transcript() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path());

        let path = writer.persist(&[], "empty").await.unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_repeated_saves_never_overwrite() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path());
        let turns = sample_transcript();

        let (a, b) = tokio::join!(
            writer.persist(turns.turns(), "same"),
            writer.persist(turns.turns(), "same")
        );

        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file in the way").unwrap();
        let writer = PersistenceWriter::new(blocker.join("transcripts"));

        let err = writer.persist(&[], "x").await.unwrap_err();

        assert!(matches!(err, PersistError::CreateDir { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo_partial.txt");
        std::fs::write(&path, "[1] 2025-03-01T09:00:00.000Z\nGood mor").unwrap();

        let result = write_or_discard(&path, FullDisk, render(sample_transcript().turns()).as_bytes()).await;

        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_successful_write_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.txt");
        let file = fs::File::create(&path).await.unwrap();

        write_or_discard(&path, file, b"[1] hello\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[1] hello\n");
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("kitchen/../etc"), "kitchen____etc");
        assert_eq!(sanitize_label("   "), "session");
        assert_eq!(sanitize_label("abc-123_x"), "abc-123_x");
    }
}
