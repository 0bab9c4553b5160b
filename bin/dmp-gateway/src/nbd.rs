//! NBD (Network Block Device) newstyle server
//!
//! Serves every registered volume as an export named after it. Each
//! transmission command becomes a [`Bio`] delivered to the remapper; the
//! reply goes out once the dispatcher completes the request. Requests on one
//! connection are handled in order.

#![allow(clippy::cast_possible_truncation)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dmp_target::{Bio, BioResult, MappedVolume, SECTOR_SHIFT, SECTOR_SIZE, TargetRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags
const NBD_FLAG_C_NO_ZEROES: u32 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_READ_ONLY: u16 = 0x0002;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
const NBD_FLAG_SEND_TRIM: u16 = 0x0020;
const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 0x0040;

// Info types
const NBD_INFO_EXPORT: u16 = 0;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;
const NBD_CMD_WRITE_ZEROES: u16 = 6;

// Error values
const NBD_EPERM: u32 = 1;
const NBD_EIO: u32 = 5;
const NBD_ENOMEM: u32 = 12;
const NBD_EINVAL: u32 = 22;
const NBD_ENOSPC: u32 = 28;

/// Largest payload accepted in one command
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

/// Option data larger than this is a protocol violation
const MAX_OPTION_BYTES: u32 = 64 * 1024;

pub struct NbdServer {
    registry: Arc<TargetRegistry>,
}

impl NbdServer {
    pub const fn new(registry: Arc<TargetRegistry>) -> Self {
        Self { registry }
    }

    /// Accept clients until the listener fails permanently
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("NBD: listening on {addr}");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            warn!("NBD: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        info!("NBD: client {peer} connected");

        // ── Handshake ─────────────────────────────────────────────────────────
        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;

        let client_flags = stream.read_u32().await?;

        // ── Option negotiation ────────────────────────────────────────────────
        let volume = self.negotiate_options(&mut stream, client_flags).await?;

        // ── Data phase ────────────────────────────────────────────────────────
        self.data_phase(&mut stream, &volume, peer).await?;

        info!("NBD: client {peer} disconnected from '{}'", volume.name());
        Ok(())
    }

    async fn negotiate_options(
        &self,
        stream: &mut TcpStream,
        client_flags: u32,
    ) -> anyhow::Result<Arc<MappedVolume>> {
        loop {
            // Option header: IHAVEOPT magic (8) + option (4) + length (4)
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                return Err(anyhow::anyhow!("bad option magic: {magic:#x}"));
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > MAX_OPTION_BYTES {
                return Err(anyhow::anyhow!("option data too large: {data_len}"));
            }

            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Err(anyhow::anyhow!("client sent NBD_OPT_ABORT"));
                }

                NBD_OPT_LIST => {
                    for (name, _) in self.registry.list() {
                        let name_bytes = name.as_bytes();
                        let mut reply_data = Vec::with_capacity(4 + name_bytes.len());
                        reply_data.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
                        reply_data.extend_from_slice(name_bytes);
                        send_option_reply(stream, option, NBD_REP_SERVER, &reply_data).await?;
                    }
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    // u32 name_len + name + u16 info request count + requests
                    let Some(name) = parse_export_name(&option_data) else {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, b"malformed")
                            .await?;
                        continue;
                    };

                    let Some(volume) = self.registry.get(&name) else {
                        send_option_reply(
                            stream,
                            option,
                            NBD_REP_ERR_UNKNOWN,
                            b"export not found",
                        )
                        .await?;
                        continue;
                    };

                    let mut info = Vec::with_capacity(12);
                    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info.extend_from_slice(&volume.size_bytes().to_be_bytes());
                    info.extend_from_slice(&transmission_flags(&volume).to_be_bytes());
                    send_option_reply(stream, option, NBD_REP_INFO, &info).await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;

                    if option == NBD_OPT_GO {
                        return Ok(volume);
                    }
                }

                NBD_OPT_EXPORT_NAME => {
                    // No option reply; size and flags go out directly, and an
                    // unknown name ends the session.
                    let name = String::from_utf8_lossy(&option_data).to_string();
                    let volume = self
                        .registry
                        .get(&name)
                        .ok_or_else(|| anyhow::anyhow!("export '{name}' not found"))?;
                    stream.write_u64(volume.size_bytes()).await?;
                    stream.write_u16(transmission_flags(&volume)).await?;
                    if client_flags & NBD_FLAG_C_NO_ZEROES == 0 {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    return Ok(volume);
                }

                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported").await?;
                }
            }
        }
    }

    async fn data_phase(
        &self,
        stream: &mut TcpStream,
        volume: &MappedVolume,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        loop {
            // magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4)
            let magic = stream.read_u32().await?;
            if magic != NBD_REQUEST_MAGIC {
                return Err(anyhow::anyhow!("bad request magic: {magic:#x}"));
            }
            let _flags = stream.read_u16().await?;
            let cmd = stream.read_u16().await?;
            let handle = stream.read_u64().await?;
            let offset = stream.read_u64().await?;
            let length = stream.read_u32().await?;

            match cmd {
                NBD_CMD_READ => {
                    if let Err(code) = check_range(volume, offset, length) {
                        send_reply(stream, handle, code).await?;
                        continue;
                    }
                    let bio = Bio::read(offset >> SECTOR_SHIFT, length);
                    match self.submit(volume, bio).await {
                        Ok(data) => {
                            send_reply(stream, handle, 0).await?;
                            stream.write_all(&data).await?;
                        }
                        Err(e) => {
                            warn!("NBD read error for {peer}: {e}");
                            send_reply(stream, handle, io_errno(&e)).await?;
                        }
                    }
                }

                NBD_CMD_WRITE => {
                    if length > MAX_REQUEST_BYTES {
                        return Err(anyhow::anyhow!("write of {length} bytes exceeds limit"));
                    }
                    let mut data = vec![0u8; length as usize];
                    stream.read_exact(&mut data).await?;

                    let code = if volume.read_only() {
                        NBD_EPERM
                    } else if let Err(code) = check_range(volume, offset, length) {
                        code
                    } else {
                        let bio = Bio::write(offset >> SECTOR_SHIFT, Bytes::from(data));
                        self.completion_code(volume, bio, peer).await
                    };
                    send_reply(stream, handle, code).await?;
                }

                NBD_CMD_FLUSH => {
                    let code = self.completion_code(volume, Bio::flush(), peer).await;
                    send_reply(stream, handle, code).await?;
                }

                NBD_CMD_TRIM | NBD_CMD_WRITE_ZEROES => {
                    let code = if volume.read_only() {
                        NBD_EPERM
                    } else if let Err(code) = check_range(volume, offset, length) {
                        code
                    } else {
                        let sector = offset >> SECTOR_SHIFT;
                        let bio = if cmd == NBD_CMD_TRIM {
                            Bio::discard(sector, length)
                        } else {
                            Bio::write_zeroes(sector, length)
                        };
                        self.completion_code(volume, bio, peer).await
                    };
                    send_reply(stream, handle, code).await?;
                }

                NBD_CMD_DISC => {
                    info!("NBD: client {peer} sent disconnect for '{}'", volume.name());
                    return Ok(());
                }

                _ => {
                    warn!("NBD: unknown command {cmd} from {peer}");
                    send_reply(stream, handle, NBD_EINVAL).await?;
                }
            }
        }
    }

    /// Hand a request to the remapper and wait for the dispatcher to finish it
    async fn submit(&self, volume: &MappedVolume, bio: Bio) -> BioResult {
        let (bio, rx) = bio.with_completion();
        self.registry.remapper().map(volume.descriptor(), bio);
        rx.await
            .unwrap_or_else(|_| Err(std::io::Error::other("request dropped before completion")))
    }

    async fn completion_code(&self, volume: &MappedVolume, bio: Bio, peer: SocketAddr) -> u32 {
        let op = bio.op();
        match self.submit(volume, bio).await {
            Ok(_) => 0,
            Err(e) => {
                warn!("NBD {} error for {peer}: {e}", op.as_str());
                io_errno(&e)
            }
        }
    }
}

fn transmission_flags(volume: &MappedVolume) -> u16 {
    let mut flags =
        NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM | NBD_FLAG_SEND_WRITE_ZEROES;
    if volume.read_only() {
        flags |= NBD_FLAG_READ_ONLY;
    }
    flags
}

/// Name from `NBD_OPT_INFO` / `NBD_OPT_GO` option data
fn parse_export_name(data: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let name_len = u32::from_be_bytes(len_bytes) as usize;
    let name = data.get(4..4 + name_len)?;
    Some(String::from_utf8_lossy(name).to_string())
}

/// Requests must be sector aligned and inside the export
fn check_range(volume: &MappedVolume, offset: u64, length: u32) -> Result<(), u32> {
    if length > MAX_REQUEST_BYTES {
        return Err(NBD_EINVAL);
    }
    if offset % SECTOR_SIZE != 0 || u64::from(length) % SECTOR_SIZE != 0 {
        return Err(NBD_EINVAL);
    }
    match offset.checked_add(u64::from(length)) {
        Some(end) if end <= volume.size_bytes() => Ok(()),
        _ => Err(NBD_ENOSPC),
    }
}

fn io_errno(e: &std::io::Error) -> u32 {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => NBD_EPERM,
        std::io::ErrorKind::InvalidInput => NBD_EINVAL,
        std::io::ErrorKind::OutOfMemory | std::io::ErrorKind::WouldBlock => NBD_ENOMEM,
        std::io::ErrorKind::StorageFull => NBD_ENOSPC,
        _ => NBD_EIO,
    }
}

async fn send_option_reply(
    stream: &mut TcpStream,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> anyhow::Result<()> {
    stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

async fn send_reply(stream: &mut TcpStream, handle: u64, error: u32) -> anyhow::Result<()> {
    stream.write_u32(NBD_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    debug!(handle, error, "NBD reply");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmp_target::{IoDispatcher, IoStatistics, Remapper, TableMode};
    use tempfile::NamedTempFile;

    struct Fixture {
        _file: NamedTempFile,
        stats: Arc<IoStatistics>,
        addr: SocketAddr,
    }

    async fn start(read_only: bool) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let stats = Arc::new(IoStatistics::new());
        let dispatcher = Arc::new(IoDispatcher::new(2, 64).unwrap());
        let registry = Arc::new(TargetRegistry::new(Remapper::new(
            Arc::clone(&stats),
            dispatcher,
        )));
        let mode = if read_only {
            TableMode::read_only()
        } else {
            TableMode::default()
        };
        registry.create("vol0", 0, &[path], mode).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(NbdServer::new(registry)).serve(listener));
        Fixture {
            _file: file,
            stats,
            addr,
        }
    }

    /// Handshake and `NBD_OPT_GO`; returns the export size and flags
    async fn connect(addr: SocketAddr, export: &str) -> (TcpStream, u64, u16) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(stream.read_u64().await.unwrap(), NBD_MAGIC);
        assert_eq!(stream.read_u64().await.unwrap(), NBD_IHAVEOPT);
        let _flags = stream.read_u16().await.unwrap();
        stream
            .write_u32(u32::from(NBD_FLAG_FIXED_NEWSTYLE) | NBD_FLAG_C_NO_ZEROES)
            .await
            .unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        stream.write_u64(NBD_IHAVEOPT).await.unwrap();
        stream.write_u32(NBD_OPT_GO).await.unwrap();
        stream.write_u32(data.len() as u32).await.unwrap();
        stream.write_all(&data).await.unwrap();

        // NBD_REP_INFO
        assert_eq!(stream.read_u64().await.unwrap(), NBD_OPTION_REPLY_MAGIC);
        assert_eq!(stream.read_u32().await.unwrap(), NBD_OPT_GO);
        assert_eq!(stream.read_u32().await.unwrap(), NBD_REP_INFO);
        assert_eq!(stream.read_u32().await.unwrap(), 12);
        assert_eq!(stream.read_u16().await.unwrap(), NBD_INFO_EXPORT);
        let size = stream.read_u64().await.unwrap();
        let flags = stream.read_u16().await.unwrap();

        // NBD_REP_ACK
        assert_eq!(stream.read_u64().await.unwrap(), NBD_OPTION_REPLY_MAGIC);
        assert_eq!(stream.read_u32().await.unwrap(), NBD_OPT_GO);
        assert_eq!(stream.read_u32().await.unwrap(), NBD_REP_ACK);
        assert_eq!(stream.read_u32().await.unwrap(), 0);
        (stream, size, flags)
    }

    async fn request(stream: &mut TcpStream, cmd: u16, handle: u64, offset: u64, length: u32) {
        stream.write_u32(NBD_REQUEST_MAGIC).await.unwrap();
        stream.write_u16(0).await.unwrap();
        stream.write_u16(cmd).await.unwrap();
        stream.write_u64(handle).await.unwrap();
        stream.write_u64(offset).await.unwrap();
        stream.write_u32(length).await.unwrap();
    }

    /// Returns the error field of a simple reply
    async fn reply(stream: &mut TcpStream, handle: u64) -> u32 {
        assert_eq!(stream.read_u32().await.unwrap(), NBD_REPLY_MAGIC);
        let error = stream.read_u32().await.unwrap();
        assert_eq!(stream.read_u64().await.unwrap(), handle);
        error
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_updates_stats() {
        let fixture = start(false).await;
        let (mut stream, size, flags) = connect(fixture.addr, "vol0").await;
        assert_eq!(size, 1 << 20);
        assert_eq!(flags & NBD_FLAG_READ_ONLY, 0);

        request(&mut stream, NBD_CMD_WRITE, 1, 4096, 4096).await;
        stream.write_all(&[0x5a; 4096]).await.unwrap();
        assert_eq!(reply(&mut stream, 1).await, 0);

        request(&mut stream, NBD_CMD_FLUSH, 2, 0, 0).await;
        assert_eq!(reply(&mut stream, 2).await, 0);

        request(&mut stream, NBD_CMD_READ, 3, 4096, 4096).await;
        assert_eq!(reply(&mut stream, 3).await, 0);
        let mut data = vec![0u8; 4096];
        stream.read_exact(&mut data).await.unwrap();
        assert!(data.iter().all(|&b| b == 0x5a));

        request(&mut stream, NBD_CMD_TRIM, 4, 0, 512).await;
        assert_eq!(reply(&mut stream, 4).await, 0);

        request(&mut stream, NBD_CMD_DISC, 5, 0, 0).await;

        let report = fixture.stats.report();
        assert_eq!(report.read.ops, 1);
        assert_eq!(report.read.avg_size, 4096);
        assert_eq!(report.write.ops, 1);
        assert_eq!(report.total.ops, 2);
    }

    #[tokio::test]
    async fn test_out_of_range_and_unaligned() {
        let fixture = start(false).await;
        let (mut stream, size, _) = connect(fixture.addr, "vol0").await;

        request(&mut stream, NBD_CMD_READ, 1, size, 512).await;
        assert_eq!(reply(&mut stream, 1).await, NBD_ENOSPC);

        request(&mut stream, NBD_CMD_READ, 2, 100, 512).await;
        assert_eq!(reply(&mut stream, 2).await, NBD_EINVAL);

        request(&mut stream, NBD_CMD_DISC, 3, 0, 0).await;
        assert_eq!(fixture.stats.report().total.ops, 0);
    }

    #[tokio::test]
    async fn test_read_only_export_refuses_writes() {
        let fixture = start(true).await;
        let (mut stream, _, flags) = connect(fixture.addr, "vol0").await;
        assert_ne!(flags & NBD_FLAG_READ_ONLY, 0);

        request(&mut stream, NBD_CMD_WRITE, 7, 0, 512).await;
        stream.write_all(&[1u8; 512]).await.unwrap();
        assert_eq!(reply(&mut stream, 7).await, NBD_EPERM);

        request(&mut stream, NBD_CMD_DISC, 8, 0, 0).await;
        assert_eq!(fixture.stats.report().write.ops, 0);
    }

    #[test]
    fn test_parse_export_name() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"vol0\0\0");
        assert_eq!(parse_export_name(&data).as_deref(), Some("vol0"));
        assert_eq!(parse_export_name(&[0, 0, 0, 9, b'a']), None);
        assert_eq!(parse_export_name(&[0, 0]), None);
    }

    #[test]
    fn test_io_errno() {
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(io_errno(&e), NBD_EIO);
        let e = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(io_errno(&e), NBD_ENOMEM);
    }
}
