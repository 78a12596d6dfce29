/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::io;
use std::net::Shutdown;
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Lower than the HTTP-layer idle timeout (§4.6) so a dead TCP peer is
/// reaped by the kernel before an HTTP-level timeout would otherwise fire.
const TCP_KEEPALIVE: Duration = Duration::from_secs(20);

/// A dialed TCP connection plus a duplicated file descriptor that lets the
/// pool force a reset (§4.6) after the stream itself has been handed off to
/// a hyper connection task. `socket` is an independent fd referring to the
/// same kernel socket; `shutdown` on it affects the connection regardless of
/// who still holds the original.
pub struct TrackedConnection {
    pub id: Uuid,
    socket: Socket,
}

impl TrackedConnection {
    /// Dials `addr`, returning the async stream to hand to the HTTP layer
    /// and the tracked handle used later for forced reset.
    pub async fn dial(addr: std::net::SocketAddr) -> io::Result<(TcpStream, Self)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let std_stream = stream.into_std()?;
        let socket = Socket::from(std_stream);
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
        let tracked_fd = socket.try_clone()?;
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        Ok((
            stream,
            TrackedConnection {
                id: Uuid::new_v4(),
                socket: tracked_fd,
            },
        ))
    }

    /// Forces an RST instead of a clean FIN, unblocking a response that's
    /// mid-stream from a backend whose sandbox has gone away (§4.6, §8
    /// "forced reset on pool close").
    pub fn reset(&self) -> io::Result<()> {
        self.socket.set_linger(Some(Duration::ZERO))?;
        self.socket.shutdown(Shutdown::Both)
    }
}
