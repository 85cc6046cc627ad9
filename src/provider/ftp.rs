//! FTP / FTPS backend
//!
//! suppaftp's stream is blocking and stateful, so each provider owns one
//! dedicated worker thread holding the control connection. Every operation is
//! a job on that thread's queue; jobs never interleave on the wire.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::{FileSystemProvider, Metadata};
use crate::workspace::url_utils::{child_url, decoded_path};
use crate::workspace::FsError;

type FtpStream = NativeTlsFtpStream;
type Job = Box<dyn FnOnce(&mut FtpStream) + Send>;

const DEFAULT_FTP_PORT: u16 = 21;
const FTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host part of an `ftp://` or `ftps://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl FtpTarget {
    pub fn parse(url: &Url) -> Result<Self, FsError> {
        let secure = match url.scheme() {
            "ftp" => false,
            "ftps" => true,
            other => return Err(FsError::InvalidHost(format!("Unsupported scheme: {}", other))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FsError::InvalidHost(url.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_FTP_PORT),
            secure,
        })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) fn map_ftp_error(err: FtpError, path: &str) -> FsError {
    let msg = err.to_string();
    if msg.contains("550") || msg.contains("No such file") {
        FsError::NotFound(path.to_string())
    } else if msg.contains("530") {
        FsError::AuthenticationFailure(msg)
    } else if matches!(err, FtpError::ConnectionError(_)) {
        FsError::ConnectionFailure(msg)
    } else {
        FsError::OperationFailed(msg)
    }
}

/// Parse raw LIST lines into entries, skipping `.`/`..` and unparseable lines
pub(crate) fn parse_listing(lines: &[String]) -> Vec<ListEntry> {
    lines
        .iter()
        .filter_map(|line| match line.parse::<ListEntry>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unparseable LIST line {:?}: {:?}", line, e);
                None
            }
        })
        .filter(|entry| entry.name() != "." && entry.name() != "..")
        .collect()
}

fn list_entries(ftp: &mut FtpStream, path: &str) -> Result<Vec<ListEntry>, FsError> {
    let lines = ftp.list(Some(path)).map_err(|e| map_ftp_error(e, path))?;
    Ok(parse_listing(&lines))
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Entry describing `path`, found by listing its parent
fn stat(ftp: &mut FtpStream, path: &str) -> Result<ListEntry, FsError> {
    let (parent, name) = split_parent(path);
    list_entries(ftp, &parent)?
        .into_iter()
        .find(|entry| entry.name() == name)
        .ok_or_else(|| FsError::NotFound(path.to_string()))
}

fn download(ftp: &mut FtpStream, path: &str) -> Result<Vec<u8>, FsError> {
    Ok(ftp
        .retr_as_buffer(path)
        .map_err(|e| map_ftp_error(e, path))?
        .into_inner())
}

fn upload(ftp: &mut FtpStream, path: &str, data: Vec<u8>) -> Result<(), FsError> {
    ftp.put_file(path, &mut Cursor::new(data))
        .map_err(|e| map_ftp_error(e, path))?;
    Ok(())
}

fn copy_tree(ftp: &mut FtpStream, from: &str, to: &str, is_directory: bool) -> Result<(), FsError> {
    if !is_directory {
        let data = download(ftp, from)?;
        return upload(ftp, to, data);
    }
    ftp.mkdir(to).map_err(|e| map_ftp_error(e, to))?;
    for entry in list_entries(ftp, from)? {
        copy_tree(
            ftp,
            &join(from, entry.name()),
            &join(to, entry.name()),
            entry.is_directory(),
        )?;
    }
    Ok(())
}

fn remove_tree(ftp: &mut FtpStream, path: &str, is_directory: bool) -> Result<(), FsError> {
    if !is_directory {
        return ftp.rm(path).map_err(|e| map_ftp_error(e, path));
    }
    for entry in list_entries(ftp, path)? {
        remove_tree(ftp, &join(path, entry.name()), entry.is_directory())?;
    }
    ftp.rmdir(path).map_err(|e| map_ftp_error(e, path))
}

fn open_session(target: &FtpTarget, username: &str, password: &str) -> Result<FtpStream, FsError> {
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&target.address())
        .map_err(|e| FsError::ConnectionFailure(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| FsError::ConnectionFailure("No address found".to_string()))?;

    let mut ftp = FtpStream::connect_timeout(addr, FTP_CONNECT_TIMEOUT)
        .map_err(|e| FsError::ConnectionFailure(e.to_string()))?;

    if target.secure {
        let tls = suppaftp::native_tls::TlsConnector::new()
            .map_err(|e| FsError::ConnectionFailure(format!("TLS setup failed: {}", e)))?;
        ftp = ftp
            .into_secure(NativeTlsConnector::from(tls), &target.host)
            .map_err(|e| FsError::ConnectionFailure(e.to_string()))?;
    }

    ftp.login(username, password).map_err(|e| match map_ftp_error(e, "/") {
        FsError::OperationFailed(msg) => FsError::AuthenticationFailure(msg),
        other => other,
    })?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| map_ftp_error(e, "/"))?;
    Ok(ftp)
}

pub struct FtpProvider {
    target: FtpTarget,
    jobs: mpsc::UnboundedSender<Job>,
}

impl FtpProvider {
    /// Log in and start the session worker
    pub async fn connect(target: FtpTarget, username: &str, password: &str) -> Result<Self, FsError> {
        info!("Connecting to FTP server at {}", target.address());

        let session_target = target.clone();
        let username = username.to_string();
        let password = password.to_string();
        let ftp = tokio::task::spawn_blocking(move || open_session(&session_target, &username, &password))
            .await
            .map_err(|e| FsError::ConnectionFailure(e.to_string()))??;

        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = format!("ftp-{}", target.host);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut ftp = ftp;
                while let Some(job) = rx.blocking_recv() {
                    job(&mut ftp);
                }
                if let Err(e) = ftp.quit() {
                    debug!("FTP quit failed: {}", e);
                }
            })
            .map_err(FsError::Io)?;

        info!("FTP session ready on {}", target.address());
        Ok(Self { target, jobs })
    }

    pub fn target(&self) -> &FtpTarget {
        &self.target
    }

    /// Run a job on the session thread and await its result
    async fn run<T, F>(&self, job: F) -> Result<T, FsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, FsError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |ftp| {
                let _ = reply_tx.send(job(ftp));
            }))
            .map_err(|_| FsError::ConnectionFailure("FTP session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| FsError::ConnectionFailure("FTP session closed".to_string()))?
    }

    fn check_url(&self, url: &Url) -> Result<String, FsError> {
        let target = FtpTarget::parse(url)?;
        if target != self.target {
            return Err(FsError::OperationFailed(format!(
                "{} does not belong to this FTP session",
                url
            )));
        }
        Ok(decoded_path(url))
    }
}

#[async_trait]
impl FileSystemProvider for FtpProvider {
    async fn list_children(&self, url: &Url) -> Result<Vec<Url>, FsError> {
        let path = self.check_url(url)?;
        let entries = self.run(move |ftp| list_entries(ftp, &path)).await?;
        entries
            .iter()
            .map(|entry| child_url(url, entry.name(), entry.is_directory()))
            .collect()
    }

    async fn exists(&self, url: &Url) -> bool {
        let Ok(path) = self.check_url(url) else {
            return false;
        };
        if path == "/" {
            return true;
        }
        self.run(move |ftp| stat(ftp, &path)).await.is_ok()
    }

    async fn create_directory(&self, url: &Url, recursive: bool) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        self.run(move |ftp| {
            if !recursive {
                return ftp.mkdir(&path).map_err(|e| map_ftp_error(e, &path));
            }
            let mut current = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current = join(if current.is_empty() { "/" } else { &current }, segment);
                if stat(ftp, &current).is_err() {
                    ftp.mkdir(&current).map_err(|e| map_ftp_error(e, &current))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn copy(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        let source = self.check_url(from)?;

        if to.scheme() == "file" {
            // Download: fetch the whole file, then write it locally
            let local = super::local::to_path(to)?;
            let data = self.run(move |ftp| download(ftp, &source)).await?;
            tokio::fs::write(local, data).await?;
            return Ok(());
        }

        let target = self.check_url(to)?;
        self.run(move |ftp| {
            let is_directory = stat(ftp, &source)?.is_directory();
            copy_tree(ftp, &source, &target, is_directory)
        })
        .await
    }

    async fn move_item(&self, from: &Url, to: &Url) -> Result<(), FsError> {
        let source = self.check_url(from)?;
        let target = self.check_url(to)?;
        self.run(move |ftp| {
            ftp.rename(&source, &target)
                .map_err(|e| map_ftp_error(e, &source))
        })
        .await
    }

    async fn remove(&self, url: &Url) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        self.run(move |ftp| {
            let is_directory = stat(ftp, &path)?.is_directory();
            remove_tree(ftp, &path, is_directory)
        })
        .await
    }

    async fn read_all(&self, url: &Url) -> Result<Vec<u8>, FsError> {
        let path = self.check_url(url)?;
        self.run(move |ftp| download(ftp, &path)).await
    }

    async fn write_all(
        &self,
        url: &Url,
        data: &[u8],
        atomic: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let path = self.check_url(url)?;
        let data = data.to_vec();
        self.run(move |ftp| {
            let exists = stat(ftp, &path).is_ok();
            if exists && !overwrite {
                return Err(FsError::AlreadyExists(path));
            }
            if !atomic {
                return upload(ftp, &path, data);
            }

            let (parent, name) = split_parent(&path);
            let temp = join(&parent, &format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
            upload(ftp, &temp, data)?;
            // Servers disagree on renaming over an existing file
            if exists {
                if let Err(e) = ftp.rm(&path) {
                    let _ = ftp.rm(&temp);
                    return Err(map_ftp_error(e, &path));
                }
            }
            ftp.rename(&temp, &path).map_err(|e| map_ftp_error(e, &path))
        })
        .await
    }

    async fn metadata(&self, url: &Url) -> Result<Metadata, FsError> {
        let path = self.check_url(url)?;
        if path == "/" {
            return Ok(Metadata {
                size: 0,
                is_directory: true,
                modified_at: None,
                created_at: None,
            });
        }
        let entry = self.run(move |ftp| stat(ftp, &path)).await?;
        Ok(Metadata {
            size: entry.size() as u64,
            is_directory: entry.is_directory(),
            modified_at: Some(DateTime::<Utc>::from(entry.modified())),
            // LIST carries no creation time
            created_at: None,
        })
    }

    async fn disconnect(&self) {
        // Runs after every job queued before it
        let quit = self.run(|ftp| ftp.quit().map_err(|e| map_ftp_error(e, "/")));
        if let Err(e) = quit.await {
            warn!("FTP quit failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_url() {
        let plain = FtpTarget::parse(&Url::parse("ftp://files.example.com/pub/").unwrap()).unwrap();
        assert_eq!(plain.port, 21);
        assert!(!plain.secure);

        let secure = FtpTarget::parse(&Url::parse("ftps://files.example.com:990/").unwrap()).unwrap();
        assert_eq!(secure.port, 990);
        assert!(secure.secure);

        assert!(matches!(
            FtpTarget::parse(&Url::parse("sftp://files.example.com/").unwrap()),
            Err(FsError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_listing_directory_flag_drives_trailing_slash() {
        let lines = vec![
            "drwxrwxr-x 1 0  1  4096 Nov 5 2018 provola".to_string(),
            "-rw-rw-r-- 1 0  1  8192 Nov 5 2018 omar.txt".to_string(),
            "drwxr-xr-x 2 0  0  4096 Nov 5 2018 .".to_string(),
            "total 12".to_string(),
        ];
        let entries = parse_listing(&lines);
        assert_eq!(entries.len(), 2);

        let dir = Url::parse("ftp://h/pub/").unwrap();
        let urls: Vec<String> = entries
            .iter()
            .map(|e| child_url(&dir, e.name(), e.is_directory()).unwrap().to_string())
            .collect();
        assert_eq!(urls, ["ftp://h/pub/provola/", "ftp://h/pub/omar.txt"]);
        assert_eq!(entries[1].size(), 8192);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(split_parent("/pub/a.txt"), ("/pub".to_string(), "a.txt".to_string()));
        assert_eq!(split_parent("/a.txt"), ("/".to_string(), "a.txt".to_string()));
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/pub", "a"), "/pub/a");
    }

    #[test]
    fn test_error_mapping() {
        let refused = FtpError::ConnectionError(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(map_ftp_error(refused, "/"), FsError::ConnectionFailure(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = FtpTarget {
            host: "127.0.0.1".into(),
            port,
            secure: false,
        };
        let result = FtpProvider::connect(target, "anonymous", "guest").await;
        assert!(matches!(result, Err(FsError::ConnectionFailure(_))));
    }
}
