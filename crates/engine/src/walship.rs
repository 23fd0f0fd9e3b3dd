//! WAL shipping.
//!
//! A long-lived per-server worker pulls finished segments from the
//! upstream, applies the configured compression and encryption (suffixes
//! layer as `.partial` → codec → `.aes`), and lands them in the server's
//! WAL directory, optionally mirroring into a secondary shipping
//! directory. Auth and transport failures retry with exponential backoff
//! capped at the reconnect interval; other failures end the worker.

use crate::cipher::Cipher;
use crate::codec::Codec;
use crate::upstream::Upstream;
use pgharbor_core::{Error, Result};
use pgharbor_wal::segment::{parse_file_name, SegmentName};
use pgharbor_wal::DEFAULT_SEGMENT_SIZE;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Initial retry backoff.
const BACKOFF_START: Duration = Duration::from_secs(1);
/// Poll interval while the upstream has nothing new.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Archive one segment's bytes under the configured codec and cipher.
///
/// Returns the path written. The stored name layers the codec suffix then
/// `.aes`.
pub fn archive_segment(
    name: &str,
    bytes: &[u8],
    codec: &dyn Codec,
    cipher: &dyn Cipher,
    wal_dir: &Path,
) -> Result<PathBuf> {
    let mut data = codec.encode(bytes)?;
    let mut file_name = name.to_string();
    if !codec.suffix().is_empty() {
        file_name.push('.');
        file_name.push_str(codec.suffix());
    }
    data = cipher.encrypt(&data)?;
    if !cipher.suffix().is_empty() {
        file_name.push('.');
        file_name.push_str(cipher.suffix());
    }

    std::fs::create_dir_all(wal_dir).map_err(|e| Error::io(wal_dir, e))?;
    let path = wal_dir.join(&file_name);
    std::fs::write(&path, &data).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

/// Restore one archived segment to its plain bytes.
pub fn unarchive_segment(path: &Path, codec: &dyn Codec, cipher: &dyn Cipher) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let data = cipher.decrypt(&data)?;
    codec.decode(&data)
}

/// Long-lived shipping worker for one server.
pub struct WalShipper {
    upstream: Arc<dyn Upstream>,
    codec: Arc<dyn Codec>,
    cipher: Arc<dyn Cipher>,
    wal_dir: PathBuf,
    shipping_dir: Option<PathBuf>,
    reconnect_cap: Duration,
    stop: Arc<AtomicBool>,
}

impl WalShipper {
    /// Build a shipper writing into `wal_dir`.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        codec: Arc<dyn Codec>,
        cipher: Arc<dyn Cipher>,
        wal_dir: PathBuf,
        shipping_dir: Option<PathBuf>,
        reconnect_cap: Duration,
        stop: Arc<AtomicBool>,
    ) -> WalShipper {
        WalShipper {
            upstream,
            codec,
            cipher,
            wal_dir,
            shipping_dir,
            reconnect_cap,
            stop,
        }
    }

    /// Last already-archived segment, so a restart resumes where it left
    /// off.
    fn last_archived(&self) -> Option<SegmentName> {
        let entries = std::fs::read_dir(&self.wal_dir).ok()?;
        let mut last = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(parsed) = parse_file_name(&name, DEFAULT_SEGMENT_SIZE) {
                if !parsed.partial {
                    last = last.max(Some(parsed.name));
                }
            }
        }
        last
    }

    /// Ship every finished segment currently available, once.
    ///
    /// Returns the number of segments archived. This is also the `archive`
    /// command's implementation.
    pub fn drain(&self) -> Result<usize> {
        let mut shipped = 0;
        let mut last = self.last_archived();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            match self.upstream.next_wal_segment(last)? {
                Some((name, bytes)) => {
                    let path = archive_segment(
                        &name,
                        &bytes,
                        self.codec.as_ref(),
                        self.cipher.as_ref(),
                        &self.wal_dir,
                    )?;
                    if let Some(shipping) = &self.shipping_dir {
                        crate::linkage::link_or_copy(
                            &path,
                            &shipping.join(path.file_name().unwrap_or_default()),
                        )?;
                    }
                    debug!(target: "pgharbor::engine", segment = %name, "segment archived");
                    last = Some(parse_file_name(&name, DEFAULT_SEGMENT_SIZE)?.name);
                    shipped += 1;
                }
                None => return Ok(shipped),
            }
        }
    }

    /// Run until stopped: drain, sleep, repeat, with capped exponential
    /// backoff on retryable failures.
    pub fn run(&self) {
        let mut backoff = BACKOFF_START;
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!(target: "pgharbor::engine", "wal shipper stopping");
                return;
            }
            match self.drain() {
                Ok(_) => {
                    backoff = BACKOFF_START;
                    std::thread::sleep(IDLE_POLL);
                }
                Err(Error::Canceled) => {
                    info!(target: "pgharbor::engine", "wal shipper canceled");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    error!(
                        target: "pgharbor::engine",
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "wal shipping failed, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.reconnect_cap);
                }
                Err(e) => {
                    error!(
                        target: "pgharbor::engine",
                        error = %e,
                        "wal shipping failed permanently"
                    );
                    return;
                }
            }
        }
    }

    /// Spawn the worker on its own thread.
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("pgharbor-walship".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn wal shipper")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::NoCipher;
    use crate::codec::{NoCodec, ZstdCodec};
    use crate::upstream::{LocalUpstream, SystemInfo};
    use pgharbor_core::Lsn;
    use tempfile::tempdir;

    fn local_upstream(dir: &Path) -> Arc<LocalUpstream> {
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::create_dir_all(dir.join("upstream-wal")).unwrap();
        Arc::new(LocalUpstream::new(
            dir.join("data"),
            dir.join("upstream-wal"),
            SystemInfo {
                system_id: 1,
                major_version: 16,
                minor_version: 0,
                timeline: 1,
                write_lsn: Lsn::ZERO,
            },
        ))
    }

    #[test]
    fn test_archive_layering() {
        let dir = tempdir().unwrap();
        let codec = ZstdCodec { level: 3 };
        let path = archive_segment(
            "000000010000000000000001",
            b"segment bytes",
            &codec,
            &NoCipher,
            dir.path(),
        )
        .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "000000010000000000000001.zstd"
        );

        let restored = unarchive_segment(&path, &codec, &NoCipher).unwrap();
        assert_eq!(restored, b"segment bytes");
    }

    #[test]
    fn test_drain_ships_in_order_and_resumes() {
        let dir = tempdir().unwrap();
        let upstream = local_upstream(dir.path());
        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
        ] {
            std::fs::write(dir.path().join("upstream-wal").join(name), name).unwrap();
        }

        let wal_dir = dir.path().join("archive");
        let shipper = WalShipper::new(
            upstream.clone(),
            Arc::new(NoCodec),
            Arc::new(NoCipher),
            wal_dir.clone(),
            None,
            Duration::from_secs(30),
            Arc::new(AtomicBool::new(false)),
        );

        assert_eq!(shipper.drain().unwrap(), 2);
        assert!(wal_dir.join("000000010000000000000001").exists());
        assert!(wal_dir.join("000000010000000000000002").exists());

        // Nothing new: drain is a no-op.
        assert_eq!(shipper.drain().unwrap(), 0);

        // A later segment appears: only it ships.
        std::fs::write(
            dir.path().join("upstream-wal/000000010000000000000003"),
            b"3",
        )
        .unwrap();
        assert_eq!(shipper.drain().unwrap(), 1);
    }

    #[test]
    fn test_shipping_dir_mirror() {
        let dir = tempdir().unwrap();
        let upstream = local_upstream(dir.path());
        std::fs::write(
            dir.path().join("upstream-wal/000000010000000000000001"),
            b"x",
        )
        .unwrap();

        let mirror = dir.path().join("mirror");
        std::fs::create_dir_all(&mirror).unwrap();
        let shipper = WalShipper::new(
            upstream,
            Arc::new(NoCodec),
            Arc::new(NoCipher),
            dir.path().join("archive"),
            Some(mirror.clone()),
            Duration::from_secs(30),
            Arc::new(AtomicBool::new(false)),
        );
        shipper.drain().unwrap();
        assert!(mirror.join("000000010000000000000001").exists());
    }

    #[test]
    fn test_stop_cancels_drain() {
        let dir = tempdir().unwrap();
        let upstream = local_upstream(dir.path());
        let stop = Arc::new(AtomicBool::new(true));
        let shipper = WalShipper::new(
            upstream,
            Arc::new(NoCodec),
            Arc::new(NoCipher),
            dir.path().join("archive"),
            None,
            Duration::from_secs(30),
            stop,
        );
        assert!(matches!(shipper.drain(), Err(Error::Canceled)));
    }
}
