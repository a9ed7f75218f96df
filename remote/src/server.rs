//! Dispatch loop run on whichever host actually has the data directory
//! mounted, translating `Request`s into `LocalIo` calls.

use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::io::DataDirIo;
use crate::local::LocalIo;
use crate::protocol::{Request, Response};
use crate::streams::{Connection, StreamError};

#[instrument(skip(stream), fields(peer = ?stream.peer_addr().ok()))]
pub async fn serve(stream: TcpStream, root: std::path::PathBuf) -> anyhow::Result<()> {
    let local = LocalIo::new(root);
    let mut conn = Connection::new(stream);
    loop {
        let request = match conn.recv.recv::<Request>().await {
            Ok(request) => request,
            Err(StreamError::Closed) => {
                debug!("peer closed the capability connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let response = dispatch(&local, request).await;
        if let Err(e) = conn.send.send(&response).await {
            warn!(error = %e, "failed to send response, closing connection");
            return Err(e.into());
        }
    }
}

async fn dispatch(local: &LocalIo, request: Request) -> Response {
    let result = async {
        Ok::<Response, common::error::IoError>(match request {
            Request::List => Response::List(local.list().await?),
            Request::ReadRange { relpath, offset, len } => {
                Response::Data(local.read_range(&relpath, offset, len).await?)
            }
            Request::Write { relpath, offset, data } => {
                local.write(&relpath, offset, &data).await?;
                Response::Ok
            }
            Request::Mkdir { relpath } => {
                local.mkdir(&relpath).await?;
                Response::Ok
            }
            Request::Symlink { relpath, target } => {
                local.symlink(&relpath, &target).await?;
                Response::Ok
            }
            Request::Readlink { relpath } => Response::Path(local.readlink(&relpath).await?),
            Request::Delete { relpath } => {
                local.delete(&relpath).await?;
                Response::Ok
            }
            Request::Sync { relpath } => {
                local.sync(&relpath).await?;
                Response::Ok
            }
            Request::CheckPostmaster => Response::PostmasterAlive(local.check_postmaster().await?),
            Request::ReadControlFile => Response::Data(local.read_control_file().await?),
        })
    }
    .await;
    result.unwrap_or_else(|e| Response::Err(e.to_string()))
}
