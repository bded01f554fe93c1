use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;

/// Text captured from one output stream of a run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

/// Reads `reader` to the end in the background, keeping at most `limit` bytes
///
/// Bytes past the limit are still read and discarded so the writer never
/// blocks on a full pipe.
pub fn spawn_capture<R>(mut reader: R, limit: usize) -> JoinHandle<std::io::Result<CapturedStream>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut truncated = false;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let room = limit.saturating_sub(kept.len());
            if n > room {
                truncated = true;
            }
            kept.extend_from_slice(&buf[..n.min(room)]);
        }

        Ok(CapturedStream {
            text: String::from_utf8_lossy(&kept).into_owned(),
            truncated,
        })
    })
}

/// Waits up to `grace` for a capture task started by [`spawn_capture`]
///
/// A stream still held open by a stray process is abandoned rather than
/// waited on forever.
pub async fn join_capture(
    task: Option<JoinHandle<std::io::Result<CapturedStream>>>,
    grace: Duration,
    name: &str,
) -> CapturedStream {
    let Some(mut task) = task else {
        return CapturedStream::default();
    };

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(stream))) => stream,
        Ok(Ok(Err(e))) => {
            log::warn!("Failed to read {name}: {e}");
            CapturedStream::default()
        }
        Ok(Err(e)) => {
            log::error!("Capture task for {name} failed: {e}");
            CapturedStream::default()
        }
        Err(_) => {
            log::warn!("{name} still open {grace:?} after the run ended, abandoning it");
            task.abort();
            CapturedStream::default()
        }
    }
}

/// One memory reading of a run, in kilobytes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub resident_kb: u64,
    pub virtual_kb: u64,
}

/// Background sampler tracking the peak memory of one run
pub struct MemoryWatch {
    peak_resident: Arc<AtomicU64>,
    peak_virtual: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MemoryWatch {
    /// Calls `read` every `interval` until stopped; `None` readings are skipped
    pub fn spawn<F, Fut>(interval: Duration, mut read: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<MemoryUsage>> + Send + 'static,
    {
        let peak_resident = Arc::new(AtomicU64::new(0));
        let peak_virtual = Arc::new(AtomicU64::new(0));

        let resident = Arc::clone(&peak_resident);
        let virt = Arc::clone(&peak_virtual);
        let task = tokio::spawn(async move {
            loop {
                if let Some(usage) = read().await {
                    resident.fetch_max(usage.resident_kb, Ordering::Relaxed);
                    virt.fetch_max(usage.virtual_kb, Ordering::Relaxed);
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self {
            peak_resident,
            peak_virtual,
            task,
        }
    }

    pub fn record(&self, usage: MemoryUsage) {
        self.peak_resident
            .fetch_max(usage.resident_kb, Ordering::Relaxed);
        self.peak_virtual.fetch_max(usage.virtual_kb, Ordering::Relaxed);
    }

    pub fn peak(&self) -> MemoryUsage {
        MemoryUsage {
            resident_kb: self.peak_resident.load(Ordering::Relaxed),
            virtual_kb: self.peak_virtual.load(Ordering::Relaxed),
        }
    }

    /// Stops sampling and returns the peak seen so far
    pub fn stop(self) -> MemoryUsage {
        self.task.abort();
        self.peak()
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reads the memory high-water marks of `pid` from procfs
pub async fn read_proc_memory(pid: u32) -> Option<MemoryUsage> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_proc_status(&status)
}

/// Extracts `VmHWM` (peak resident) and `VmPeak` (peak virtual) from a
/// `/proc/<pid>/status` document
pub fn parse_proc_status(status: &str) -> Option<MemoryUsage> {
    let mut usage = MemoryUsage::default();
    let mut found = false;

    for line in status.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let kb = || {
                value
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse::<u64>()
                    .ok()
            };
            match key {
                "VmHWM" => {
                    usage.resident_kb = kb()?;
                    found = true;
                }
                "VmPeak" => {
                    usage.virtual_kb = kb()?;
                    found = true;
                }
                _ => {}
            }
        }
    }

    found.then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_keeps_everything_under_limit() {
        let task = spawn_capture(&b"hello\nworld\n"[..], 1024);
        let stream = join_capture(Some(task), Duration::from_secs(1), "stdout").await;
        assert_eq!(stream.text, "hello\nworld\n");
        assert!(!stream.truncated);
    }

    #[tokio::test]
    async fn test_capture_truncates_and_drains() {
        let data = vec![b'a'; 100_000];
        let task = spawn_capture(std::io::Cursor::new(data), 10);
        let stream = join_capture(Some(task), Duration::from_secs(1), "stdout").await;
        assert_eq!(stream.text, "a".repeat(10));
        assert!(stream.truncated);
    }

    #[tokio::test]
    async fn test_join_without_task_is_empty() {
        let stream = join_capture(None, Duration::from_millis(1), "stderr").await;
        assert_eq!(stream, CapturedStream::default());
    }

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\talgo\nVmPeak:\t  204800 kB\nVmSize:\t  102400 kB\nVmHWM:\t    5120 kB\nVmRSS:\t    4096 kB\n";
        assert_eq!(
            parse_proc_status(status),
            Some(MemoryUsage {
                resident_kb: 5120,
                virtual_kb: 204800
            })
        );
        assert_eq!(parse_proc_status("Name:\tkthreadd\nState:\tS\n"), None);
    }

    #[tokio::test]
    async fn test_memory_watch_tracks_peak() {
        let readings = Arc::new(std::sync::Mutex::new(vec![300u64, 700, 500]));
        let source = Arc::clone(&readings);
        let watch = MemoryWatch::spawn(Duration::from_millis(1), move || {
            let next = source.lock().unwrap().pop();
            async move {
                next.map(|kb| MemoryUsage {
                    resident_kb: kb,
                    virtual_kb: kb * 2,
                })
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        watch.record(MemoryUsage {
            resident_kb: 100,
            virtual_kb: 100,
        });
        let peak = watch.stop();
        assert_eq!(peak.resident_kb, 700);
        assert_eq!(peak.virtual_kb, 1400);
    }

    #[tokio::test]
    async fn test_read_own_proc_memory() {
        let usage = read_proc_memory(std::process::id()).await.unwrap();
        assert!(usage.resident_kb > 0);
        assert!(usage.virtual_kb >= usage.resident_kb);
    }
}
