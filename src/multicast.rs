/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Component A: multicast endpoint creation, shared by the SAP listener and
//! every per-session RTP socket.

use crate::error::{SocketError, SocketResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{info, instrument};

/// Creates a UDP socket bound to `(group, port)`, joining the multicast
/// group first so only that group's traffic arrives. Any syscall failure
/// cleans up the partially constructed socket by simply dropping it (its
/// `Drop` impl closes the fd) and returns a [`SocketError`].
#[instrument]
pub fn create_multicast_socket(group: IpAddr, port: u16) -> SocketResult<UdpSocket> {
    let socket = match group {
        IpAddr::V4(v4) => create_ipv4_socket(v4, port)?,
        IpAddr::V6(v6) => create_ipv6_socket(v6, port)?,
    };

    socket.set_nonblocking(true).map_err(SocketError::Convert)?;

    UdpSocket::from_std(socket.into()).map_err(SocketError::Convert)
}

fn create_ipv4_socket(group: Ipv4Addr, port: u16) -> SocketResult<Socket> {
    info!("joining IPv4 multicast group {group}:{port}");

    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP)).map_err(SocketError::Create)?;

    socket.set_reuse_address(true).map_err(SocketError::Create)?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|source| SocketError::Join {
            group: IpAddr::V4(group),
            source,
        })?;

    let bind_addr = SocketAddr::new(IpAddr::V4(group), port);
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|source| SocketError::Bind {
            addr: bind_addr,
            source,
        })?;

    Ok(socket)
}

fn create_ipv6_socket(group: Ipv6Addr, port: u16) -> SocketResult<Socket> {
    info!("joining IPv6 multicast group [{group}]:{port}");

    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProto::UDP)).map_err(SocketError::Create)?;

    socket.set_reuse_address(true).map_err(SocketError::Create)?;

    socket
        .join_multicast_v6(&group, 0)
        .map_err(|source| SocketError::Join {
            group: IpAddr::V6(group),
            source,
        })?;

    let bind_addr = SocketAddr::new(IpAddr::V6(group), port);
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|source| SocketError::Bind {
            addr: bind_addr,
            source,
        })?;

    Ok(socket)
}
