use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time;
use tracing::{debug, trace, warn};
use crate::events::StopSignal;
use crate::packet::Packet;
use crate::packet_pool::PacketPool;
use crate::queue::QueueReceiver;

/// The connection's writer loop, multiplexing the packets of all requests onto the socket in the
///  order they were queued. `None` on the queue is the signal for a clean stop.
///
/// The socket is flushed whenever the queue runs empty, so that writes are batched while there
///  is more work queued. If writing fails, the whole connection is stopped, and the remaining
///  packets are released without being written until the stop sentinel arrives.
pub async fn run_writer_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut queue: QueueReceiver<Option<Packet>>,
    pool: Arc<PacketPool>,
    stop: StopSignal,
    write_timeout: Duration,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(item) = queue.get().await {
        let Some(packet) = item else {
            debug!("writer loop received stop signal");
            match time::timeout(write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error shutting down socket: {}", e),
                Err(_) => debug!("timeout shutting down socket"),
            }
            return;
        };

        trace!("writing {:?}", packet);
        let result = write_packet(&mut writer, &packet, write_timeout).await;
        pool.return_to_pool(packet);

        let result = match result {
            Ok(()) if queue.is_empty() => flush(&mut writer, write_timeout).await,
            other => other,
        };

        if let Err(e) = result {
            warn!("error writing to socket, closing connection: {}", e);
            stop.stop();
            discard_until_stop(&mut queue, &pool).await;
            return;
        }
    }
    debug!("writer queue closed");
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet, write_timeout: Duration) -> anyhow::Result<()> {
    time::timeout(write_timeout, packet.write_to_stream(writer)).await
        .map_err(|_| anyhow!("timeout writing packet"))?
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut W, write_timeout: Duration) -> anyhow::Result<()> {
    time::timeout(write_timeout, writer.flush()).await
        .map_err(|_| anyhow!("timeout flushing socket"))??;
    Ok(())
}

async fn discard_until_stop(queue: &mut QueueReceiver<Option<Packet>>, pool: &PacketPool) {
    let mut num_discarded = 0usize;
    while let Some(Some(packet)) = queue.get().await {
        pool.return_to_pool(packet);
        num_discarded += 1;
    }
    debug!("discarded {} packets after a write error", num_discarded);
}
