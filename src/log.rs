//! Worker output handling. Each spawned worker gets one copier task per
//! stream; output either lands in size-rotated files or is tagged and
//! echoed to the host console.

use crate::config::Role;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;
pub const LOG_ROTATION_KEEP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn suffix(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Where a copier task sends the lines it reads.
#[derive(Debug, Clone)]
pub enum LogSink {
    File(PathBuf),
    Console { tag: String },
}

/// Log file path for one worker stream, e.g. `buyer-node-1-stdout.log`.
pub fn worker_log_path(dir: &Path, role: Role, owner_id: &str, stream: LogStream) -> PathBuf {
    dir.join(format!("{role}-{owner_id}-{}.log", stream.suffix()))
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{index}"));
    PathBuf::from(p)
}

/// Shift `file.log` -> `file.log.1` -> ... -> `file.log.N`, dropping the
/// oldest. Best effort; rotation failures must never take the copier down.
async fn rotate_log(path: &Path) {
    let _ = tokio::fs::remove_file(rotated_path(path, LOG_ROTATION_KEEP)).await;
    for i in (1..LOG_ROTATION_KEEP).rev() {
        let _ = tokio::fs::rename(rotated_path(path, i), rotated_path(path, i + 1)).await;
    }
    let _ = tokio::fs::rename(path, rotated_path(path, 1)).await;
}

/// Copy lines from a worker pipe into the sink until the pipe closes.
/// Returns the task handle so shutdown can await drain if it cares to.
pub fn spawn_log_copier<R>(stream: LogStream, reader: R, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        match sink {
            LogSink::File(path) => {
                copy_to_file(&mut lines, &path).await;
            }
            LogSink::Console { tag } => {
                while let Ok(Some(line)) = lines.next_line().await {
                    match stream {
                        LogStream::Stdout => println!("[{tag}] {line}"),
                        LogStream::Stderr => eprintln!("[{tag}] {line}"),
                    }
                }
            }
        }
    })
}

async fn copy_to_file<R>(lines: &mut tokio::io::Lines<BufReader<R>>, path: &Path)
where
    R: AsyncRead + Unpin,
{
    let mut file = match open_append(path).await {
        Some(f) => f,
        None => return,
    };
    let mut written = file.metadata().await.map(|m| m.len()).unwrap_or(0);

    while let Ok(Some(line)) = lines.next_line().await {
        if written >= LOG_ROTATION_SIZE {
            let _ = file.flush().await;
            drop(file);
            rotate_log(path).await;
            file = match open_append(path).await {
                Some(f) => f,
                None => return,
            };
            written = 0;
        }
        if file.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if file.write_all(b"\n").await.is_err() {
            return;
        }
        written += line.len() as u64 + 1;
    }
    let _ = file.flush().await;
}

async fn open_append(path: &Path) -> Option<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_log_path_naming() {
        let path = worker_log_path(
            Path::new("/var/log/peers"),
            Role::Buyer,
            "node-1",
            LogStream::Stdout,
        );
        assert!(path.ends_with("buyer-node-1-stdout.log"));
        let path = worker_log_path(
            Path::new("/var/log/peers"),
            Role::Seller,
            "n2",
            LogStream::Stderr,
        );
        assert!(path.ends_with("seller-n2-stderr.log"));
    }

    #[test]
    fn test_rotated_path_appends_index() {
        let p = rotated_path(Path::new("/tmp/a.log"), 2);
        assert_eq!(p, Path::new("/tmp/a.log.2"));
    }

    #[tokio::test]
    async fn test_copier_writes_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let input: &[u8] = b"first line\nsecond line\n";

        spawn_log_copier(LogStream::Stdout, input, LogSink::File(path.clone()))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "first line\nsecond line\n");
    }

    #[tokio::test]
    async fn test_copier_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        tokio::fs::write(&path, "old\n").await.unwrap();

        let input: &[u8] = b"new\n";
        spawn_log_copier(LogStream::Stdout, input, LogSink::File(path.clone()))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "old\nnew\n");
    }

    #[tokio::test]
    async fn test_rotation_shifts_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        tokio::fs::write(&path, "current").await.unwrap();
        tokio::fs::write(rotated_path(&path, 1), "one").await.unwrap();
        tokio::fs::write(rotated_path(&path, 3), "three").await.unwrap();

        rotate_log(&path).await;

        assert!(!path.exists());
        assert_eq!(
            tokio::fs::read_to_string(rotated_path(&path, 1)).await.unwrap(),
            "current"
        );
        assert_eq!(
            tokio::fs::read_to_string(rotated_path(&path, 2)).await.unwrap(),
            "one"
        );
        // Old .3 dropped, nothing promoted into it from .2.
        assert!(!rotated_path(&path, 3).exists());
    }

    #[tokio::test]
    async fn test_console_sink_survives_pipe_close() {
        let input: &[u8] = b"hello\n";
        spawn_log_copier(
            LogStream::Stderr,
            input,
            LogSink::Console {
                tag: "buyer-node-1".into(),
            },
        )
        .await
        .unwrap();
    }
}
