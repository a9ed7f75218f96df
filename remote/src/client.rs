//! `DataDirIo` implementation that proxies every call over a TCP connection
//! to a `serve` loop running on the host that actually has the data
//! directory mounted (see `crate::server`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::error::{IoError, IoResult};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::io::DataDirIo;
use crate::protocol::{Request, Response};
use crate::streams::Connection;

pub struct RemoteIo {
    conn: Mutex<Connection>,
}

impl RemoteIo {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            conn: Mutex::new(Connection::new(stream)),
        }
    }

    async fn call(&self, request: Request) -> IoResult<Response> {
        let mut conn = self.conn.lock().await;
        conn.send
            .send(&request)
            .await
            .map_err(|e| IoError::Remote(e.to_string()))?;
        conn.recv
            .recv()
            .await
            .map_err(|e| IoError::Remote(e.to_string()))
    }
}

fn unexpected(response: Response) -> IoError {
    match response {
        Response::Err(msg) => IoError::Remote(msg),
        other => IoError::Remote(format!("unexpected response: {other:?}")),
    }
}

#[async_trait]
impl DataDirIo for RemoteIo {
    async fn list(&self) -> IoResult<Vec<crate::protocol::RemoteEntry>> {
        match self.call(Request::List).await? {
            Response::List(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn read_range(&self, relpath: &Path, offset: u64, len: u32) -> IoResult<Vec<u8>> {
        let request = Request::ReadRange {
            relpath: relpath.to_path_buf(),
            offset,
            len,
        };
        match self.call(request).await? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, relpath: &Path, offset: u64, data: &[u8]) -> IoResult<()> {
        let request = Request::Write {
            relpath: relpath.to_path_buf(),
            offset,
            data: data.to_vec(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn mkdir(&self, relpath: &Path) -> IoResult<()> {
        let request = Request::Mkdir {
            relpath: relpath.to_path_buf(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn symlink(&self, relpath: &Path, target: &Path) -> IoResult<()> {
        let request = Request::Symlink {
            relpath: relpath.to_path_buf(),
            target: target.to_path_buf(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn readlink(&self, relpath: &Path) -> IoResult<PathBuf> {
        let request = Request::Readlink {
            relpath: relpath.to_path_buf(),
        };
        match self.call(request).await? {
            Response::Path(target) => Ok(target),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, relpath: &Path) -> IoResult<()> {
        let request = Request::Delete {
            relpath: relpath.to_path_buf(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn sync(&self, relpath: &Path) -> IoResult<()> {
        let request = Request::Sync {
            relpath: relpath.to_path_buf(),
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn check_postmaster(&self) -> IoResult<bool> {
        match self.call(Request::CheckPostmaster).await? {
            Response::PostmasterAlive(alive) => Ok(alive),
            other => Err(unexpected(other)),
        }
    }

    async fn read_control_file(&self) -> IoResult<Vec<u8>> {
        match self.call(Request::ReadControlFile).await? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }
}
