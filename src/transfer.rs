//! File and directory transfer over a remote session.
//!
//! Directories travel as gzip-compressed tar archives streamed into a remote
//! `tar zxf -`; single files are streamed into a remote redirect. Archives
//! are cached per source path so repeated pushes of the same directory skip
//! re-packaging.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use flate2::Compression;
use flate2::write::GzEncoder;
use shell_escape::unix::escape;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ssh::Session;
use crate::utils::{TestboxDirs, cache_key, create_dir};

/// Notified with the new percentage whenever it changes; never per read.
pub type ProgressFn = Box<dyn FnMut(u8) + Send>;

pub struct Transfer<'a> {
    session: &'a Session,
    cache_dir: PathBuf,
    use_cache: bool,
}

impl<'a> Transfer<'a> {
    pub fn new(session: &'a Session) -> Result<Self> {
        let dirs = TestboxDirs::new()?;
        Ok(Self::with_cache_dir(session, dirs.cache))
    }

    pub fn with_cache_dir(session: &'a Session, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            cache_dir: cache_dir.into(),
            use_cache: true,
        }
    }

    /// When off, a fresh archive is built for every directory push.
    pub fn use_cache(mut self, on: bool) -> Self {
        self.use_cache = on;
        self
    }

    /// Remote existence test; exit status zero means present.
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        let (code, _, _) = self
            .session
            .output(&format!("test -e {}", escape(path.to_string_lossy())))
            .await?;
        debug!("exists {} -> {}", path.display(), code == 0);
        Ok(code == 0)
    }

    /// Push a local file or directory to `remote` on the machine.
    pub async fn push(
        &self,
        local: &Path,
        remote: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let meta = tokio::fs::metadata(local).await.map_err(|_| Error::NotFound {
            what: format!("local path {}", local.display()),
        })?;
        if meta.is_dir() {
            self.push_dir(local, remote, progress).await
        } else {
            self.push_file(local, remote, progress).await
        }
    }

    async fn push_dir(
        &self,
        local: &Path,
        remote: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let archive = self.cached_archive(local).await?;
        let remote_quoted = escape(remote.to_string_lossy());
        let command = format!("mkdir -p {remote_quoted}; tar zxf - -C {remote_quoted}");
        info!("Pushing {} to {}", local.display(), remote.display());
        self.stream_in(&archive, &command, progress).await
    }

    async fn push_file(
        &self,
        local: &Path,
        remote: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let command = format!("cat > {}", escape(remote.to_string_lossy()));
        info!("Pushing {} to {}", local.display(), remote.display());
        self.stream_in(local, &command, progress).await
    }

    /// Stream a local file as stdin to a remote command, with progress
    /// accounting against the file's size.
    async fn stream_in(
        &self,
        local: &Path,
        command: &str,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(local).await?;
        let total = file.metadata().await?.len();
        let reader = ProgressReader::new(file, total, progress);

        let mut stdout = tokio::io::sink();
        let mut stderr = Vec::new();
        let code = self
            .session
            .run(
                command,
                Some(reader),
                &mut stdout,
                &mut stderr,
                CancellationToken::new(),
            )
            .await?;
        if code != 0 {
            return Err(Error::Transfer {
                status: code,
                detail: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Pull a remote file into a local file.
    ///
    /// Progress needs the remote size up front; when the size query fails the
    /// pull falls back to a plain streamed copy, with a logged warning. A
    /// failed pull removes the partially written local file.
    pub async fn pull(
        &self,
        remote: &Path,
        local: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<()> {
        let remote_quoted = escape(remote.to_string_lossy());
        info!("Pulling {} to {}", remote.display(), local.display());

        let total = match progress {
            Some(_) => match self.remote_size(&remote_quoted).await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(
                        "Could not determine size of {}: {e}; pulling without progress",
                        remote.display()
                    );
                    None
                }
            },
            None => None,
        };

        let command = format!("cat {remote_quoted}");
        let mut stderr = Vec::new();
        let run_result = match (total, progress) {
            (Some(total), Some(progress)) => {
                let file = tokio::fs::File::create(local).await?;
                let mut writer = ProgressWriter::new(file, total, Some(progress));
                self.session
                    .run(
                        &command,
                        Option::<tokio::io::Empty>::None,
                        &mut writer,
                        &mut stderr,
                        CancellationToken::new(),
                    )
                    .await
            }
            _ => {
                let mut file = tokio::fs::File::create(local).await?;
                self.session
                    .run(
                        &command,
                        Option::<tokio::io::Empty>::None,
                        &mut file,
                        &mut stderr,
                        CancellationToken::new(),
                    )
                    .await
            }
        };

        let code = match run_result {
            Ok(code) => code,
            Err(e) => {
                let _ = tokio::fs::remove_file(local).await;
                return Err(e);
            }
        };
        if code != 0 {
            let _ = tokio::fs::remove_file(local).await;
            return Err(Error::Transfer {
                status: code,
                detail: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn remote_size(&self, remote_quoted: &str) -> Result<u64> {
        let (code, stdout, stderr) = self
            .session
            .output(&format!("wc -c < {remote_quoted}"))
            .await?;
        if code != 0 {
            return Err(Error::Transfer {
                status: code,
                detail: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse()
            .map_err(|_| Error::Parse(format!("unexpected size output {:?}", text.trim())))
    }

    /// The cached archive for a source directory, building it on a miss.
    ///
    /// Entries are keyed by source path only: a cache hit is served without
    /// looking at the directory's current contents, so a changed source needs
    /// `use_cache(false)` to be picked up.
    async fn cached_archive(&self, local: &Path) -> Result<PathBuf> {
        create_dir("cache", &self.cache_dir)?;
        let path = self.cache_dir.join(format!("{}.tar.gz", cache_key(local)));

        if self.use_cache && path.exists() {
            debug!("Reusing cached archive {path:?}");
            return Ok(path);
        }

        let source = tokio::fs::canonicalize(local).await?;
        debug!("Archiving {} into {path:?}", source.display());
        if let Err(e) = build_archive(&source, &path) {
            // Don't leave a truncated archive behind to be "reused" later.
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(path)
    }
}

fn build_archive(source: &Path, archive: &Path) -> Result<()> {
    let file = std::fs::File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?.finish()?.flush()?;
    Ok(())
}

/// Wraps a reader with percentage progress against a known total.
pub struct ProgressReader<R> {
    inner: R,
    total: u64,
    seen: u64,
    last_pct: Option<u8>,
    notify: Option<ProgressFn>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: u64, notify: Option<ProgressFn>) -> Self {
        Self {
            inner,
            total,
            seen: 0,
            last_pct: None,
            notify,
        }
    }

    fn bump(&mut self, n: u64) {
        self.seen += n;
        notify_pct(self.total, self.seen, &mut self.last_pct, &mut self.notify);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.bump((buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Wraps a writer with percentage progress against a known total.
pub struct ProgressWriter<W> {
    inner: W,
    total: u64,
    seen: u64,
    last_pct: Option<u8>,
    notify: Option<ProgressFn>,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, total: u64, notify: Option<ProgressFn>) -> Self {
        Self {
            inner,
            total,
            seen: 0,
            last_pct: None,
            notify,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.seen += n as u64;
                notify_pct(me.total, me.seen, &mut me.last_pct, &mut me.notify);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn notify_pct(total: u64, seen: u64, last_pct: &mut Option<u8>, notify: &mut Option<ProgressFn>) {
    let Some(callback) = notify.as_mut() else {
        return;
    };
    if total == 0 {
        return;
    }
    let pct = (seen.min(total) * 100 / total) as u8;
    if *last_pct != Some(pct) {
        *last_pct = Some(pct);
        callback(pct);
    }
}
