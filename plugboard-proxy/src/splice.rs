//! Full-duplex raw-stream bridging.
//!
//! Used for the hijacked disposition: after the response head has been
//! delivered, the client and upstream sockets become a plain byte
//! tunnel. One task is forked for the upstream→client direction while
//! the current task drives client→upstream; each direction half-closes
//! the destination's write side when its source reaches EOF, and the
//! bridge returns only once both directions have terminated.

use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Splitable};
use monoio::net::TcpStream;

const COPY_BUF: usize = 16 * 1024;

/// Copy `src` to `dst` until EOF, returning bytes moved.
pub async fn copy_stream<R, W>(src: &mut R, dst: &mut W) -> std::io::Result<u64>
where
    R: AsyncReadRent,
    W: AsyncWriteRent,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut moved: u64 = 0;
    loop {
        let (res, returned) = src.read(buf).await;
        buf = returned;
        match res {
            Ok(0) => return Ok(moved),
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                let (res, _) = dst.write_all(chunk).await;
                res?;
                moved += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bridge a client socket and a split upstream until both directions
/// reach EOF.
pub async fn splice<UR, UW>(client: TcpStream, up_read: UR, up_write: UW) -> std::io::Result<()>
where
    UR: AsyncReadRent + 'static,
    UW: AsyncWriteRent + 'static,
{
    let (mut client_read, client_write) = client.into_split();

    let reverse = monoio::spawn(async move {
        let mut src = up_read;
        let mut dst = client_write;
        let result = copy_stream(&mut src, &mut dst).await;
        // Upstream finished talking: make EOF visible to the client.
        let _ = dst.shutdown().await;
        result
    });

    let mut up_write = up_write;
    let forward = copy_stream(&mut client_read, &mut up_write).await;
    // Client finished talking: make EOF visible to the upstream.
    let _ = up_write.shutdown().await;

    // Rendezvous: wait for the reverse direction before tearing down.
    let reverse = reverse.await;

    forward.and(reverse).map(|_| ())
}
