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

use clap::Parser;
use miette::Result;
use rand::Rng;
use rtp_sap_recv::{
    config::{self, ModuleArgs},
    discovery,
    error::ServiceError,
    multicast::create_multicast_socket,
    playback::{HostSink, NullSink},
    reaper,
    registry::SessionRegistry,
    sap::Announcement,
    session,
};
use std::{net::IpAddr, time::Duration};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// SAP/SDP-discovered RTP multicast audio receiver.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the host audio sink to render into. The standalone binary
    /// has no real audio backend wired up, so this only selects the log
    /// label; playback goes to a no-op sink.
    #[arg(long, env = "RTP_SAP_RECV_SINK")]
    sink: String,

    /// Multicast group SAP announcements are listened for on.
    #[arg(long, env = "RTP_SAP_RECV_SAP_ADDRESS", default_value = config::DEFAULT_SAP_ADDRESS)]
    sap_address: IpAddr,

    /// Target end-to-end buffer fill, before the per-session sink-latency
    /// clamp (section 3) is applied.
    #[arg(long, env = "RTP_SAP_RECV_INTENDED_LATENCY_US", default_value_t = config::DEFAULT_INTENDED_LATENCY_US)]
    intended_latency_us: u64,
}

/// The two startup steps that can fail fatally: parsing module arguments and
/// binding the SAP listening socket. Both errors collapse into
/// [`ServiceError`] here, matching how this crate's error taxonomy boxes
/// fine-grained errors into a coarser one at the boundary that actually
/// reports them.
async fn startup(args: &Args) -> Result<(ModuleArgs, tokio::net::UdpSocket), ServiceError> {
    let module_args = ModuleArgs::from_parts(Some(args.sink.clone()), Some(args.sap_address.to_string()))?;
    let sap_socket = create_multicast_socket(module_args.sap_address, config::SAP_PORT)?;
    Ok((module_args, sap_socket))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (module_args, sap_socket) = startup(&args).await?;

    let local_cookie: u32 = rand::rng().random();
    info!(
        "starting rtp-sap-recv for sink '{}', SAP group {}, local cookie {:08x}",
        module_args.sink, module_args.sap_address, local_cookie
    );

    let intended_latency_us = args.intended_latency_us;

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("rtp-sap-recv", move |s| {
            run(s, sap_socket, intended_latency_us, local_cookie)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

async fn run(
    subsys: SubsystemHandle,
    sap_socket: tokio::net::UdpSocket,
    intended_latency_us: u64,
    local_cookie: u32,
) -> Result<(), std::convert::Infallible> {
    let mut registry = SessionRegistry::new();
    let mut receive_buf = [0u8; 65_535];
    let mut reaper_tick = tokio::time::interval(config::DEATH_TIMEOUT);
    reaper_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sink_factory = |_announcement: &Announcement| -> Box<dyn HostSink> { Box::new(NullSink::new()) };
    let mut starter = |announcement, latency_us, sink| session::start_session(announcement, latency_us, sink, local_cookie);

    loop {
        tokio::select! {
            Ok((len, _addr)) = sap_socket.recv_from(&mut receive_buf) => {
                discovery::handle_datagram(
                    &receive_buf[..len],
                    &mut registry,
                    intended_latency_us,
                    &mut sink_factory,
                    &mut starter,
                );
            }
            _ = reaper_tick.tick() => {
                let reaped = reaper::sweep(&mut registry);
                if reaped > 0 {
                    warn!("reaped {reaped} session(s) with no recent RTP activity");
                }
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("shutting down, {} session(s) still active", registry.len());
    Ok(())
}
