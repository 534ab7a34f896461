//! Chunked file access.
//!
//! Both directions move at most `max_chunk_size` bytes per request; the
//! host walks offsets to stream larger files. Paths must be absolute so a
//! request never depends on the agent's working directory.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{
    self, FileReadRequest, FileReadResponse, FileWriteRequest, FileWriteResponse, op,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Handler, HandlerError, RequestContext};

pub struct FileReadHandler;

impl Handler for FileReadHandler {
    fn operation(&self) -> &'static str {
        op::FILE_READ
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        read(ctx).boxed()
    }
}

pub struct FileWriteHandler;

impl Handler for FileWriteHandler {
    fn operation(&self) -> &'static str {
        op::FILE_WRITE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        write(ctx).boxed()
    }
}

fn require_absolute(path: &str) -> Result<(), HandlerError> {
    if Path::new(path).is_absolute() {
        Ok(())
    } else {
        Err(HandlerError::InvalidArgument(format!(
            "path must be absolute: {path}"
        )))
    }
}

async fn read(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: FileReadRequest = ctx.decode()?;
    require_absolute(&req.path)?;
    if req.length > ctx.cfg.max_chunk_size {
        return Err(HandlerError::InvalidArgument(format!(
            "length {} exceeds chunk limit {}",
            req.length, ctx.cfg.max_chunk_size
        )));
    }

    let mut file = tokio::fs::File::open(&req.path).await?;
    let len = file.metadata().await?.len();
    file.seek(SeekFrom::Start(req.offset)).await?;

    let mut data = vec![0u8; req.length as usize];
    let mut filled = 0;
    while filled < data.len() {
        tokio::select! {
            read = file.read(&mut data[filled..]) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            _ = ctx.cancelled() => return Err(ctx.interrupted()),
        }
    }
    data.truncate(filled);

    let eof = req.offset + filled as u64 >= len;
    Ok(ops::encode(&FileReadResponse { data, eof })?)
}

async fn write(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: FileWriteRequest = ctx.decode()?;
    require_absolute(&req.path)?;
    if req.data.len() > ctx.cfg.max_chunk_size as usize {
        return Err(HandlerError::InvalidArgument(format!(
            "chunk of {} bytes exceeds limit {}",
            req.data.len(),
            ctx.cfg.max_chunk_size
        )));
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(req.create);
    #[cfg(unix)]
    if let Some(mode) = req.mode {
        if req.create {
            options.mode(mode);
        }
    }

    let mut file = options.open(&req.path).await?;
    file.seek(SeekFrom::Start(req.offset)).await?;
    tokio::select! {
        result = async {
            file.write_all(&req.data).await?;
            file.flush().await
        } => result?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    }

    Ok(ops::encode(&FileWriteResponse {
        written: req.data.len() as u32,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testutil::{decode_response, test_ctx};

    fn read_payload(path: &str, offset: u64, length: u32) -> Vec<u8> {
        ops::encode(&FileReadRequest {
            path: path.into(),
            offset,
            length,
        })
        .unwrap()
    }

    fn write_payload(req: &FileWriteRequest) -> Vec<u8> {
        ops::encode(req).unwrap()
    }

    #[tokio::test]
    async fn reads_a_chunk_with_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();

        let (ctx, _e) = test_ctx(op::FILE_READ, read_payload(path.to_str().unwrap(), 4, 64), None);
        let resp: FileReadResponse = decode_response(&FileReadHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.data, b"456789");
        assert!(resp.eof);
    }

    #[tokio::test]
    async fn partial_read_is_not_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();

        let (ctx, _e) = test_ctx(op::FILE_READ, read_payload(path.to_str().unwrap(), 0, 4), None);
        let resp: FileReadResponse = decode_response(&FileReadHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.data, b"0123");
        assert!(!resp.eof);
    }

    #[tokio::test]
    async fn read_past_end_is_empty_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();

        let (ctx, _e) = test_ctx(op::FILE_READ, read_payload(path.to_str().unwrap(), 100, 8), None);
        let resp: FileReadResponse = decode_response(&FileReadHandler.handle(ctx).await.unwrap());
        assert!(resp.data.is_empty());
        assert!(resp.eof);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (ctx, _e) = test_ctx(op::FILE_READ, read_payload("/definitely/missing", 0, 8), None);
        let err = FileReadHandler.handle(ctx).await.unwrap_err();
        assert_eq!(err.kind(), helion_shared::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn oversized_length_is_invalid() {
        let (ctx, _e) = test_ctx(
            op::FILE_READ,
            read_payload("/etc/hostname", 0, u32::MAX),
            None,
        );
        assert!(matches!(
            FileReadHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn relative_path_is_invalid() {
        let (ctx, _e) = test_ctx(op::FILE_READ, read_payload("relative.txt", 0, 8), None);
        assert!(matches!(
            FileReadHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let req = FileWriteRequest {
            path: path.to_str().unwrap().into(),
            offset: 0,
            data: b"written by agent".to_vec(),
            create: true,
            mode: Some(0o600),
        };
        let (ctx, _e) = test_ctx(op::FILE_WRITE, write_payload(&req), None);
        let resp: FileWriteResponse = decode_response(&FileWriteHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.written as usize, req.data.len());
        assert_eq!(std::fs::read(&path).unwrap(), req.data);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn write_at_offset_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse");
        std::fs::write(&path, b"head").unwrap();

        let req = FileWriteRequest {
            path: path.to_str().unwrap().into(),
            offset: 4,
            data: b"-tail".to_vec(),
            create: false,
            mode: None,
        };
        let (ctx, _e) = test_ctx(op::FILE_WRITE, write_payload(&req), None);
        FileWriteHandler.handle(ctx).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"head-tail");
    }

    #[tokio::test]
    async fn write_without_create_needs_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let req = FileWriteRequest {
            path: path.to_str().unwrap().into(),
            offset: 0,
            data: b"x".to_vec(),
            create: false,
            mode: None,
        };
        let (ctx, _e) = test_ctx(op::FILE_WRITE, write_payload(&req), None);
        let err = FileWriteHandler.handle(ctx).await.unwrap_err();
        assert_eq!(err.kind(), helion_shared::ErrorKind::NotFound);
    }
}
