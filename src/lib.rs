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

//! SAP/SDP-discovered RTP multicast audio ingest with clock-drift
//! compensated playback. See each module for its place in the pipeline:
//! [`sap`]/[`discovery`] turn multicast SAP traffic into sessions,
//! [`session`] runs one session's realtime ingest thread, [`jitter_queue`]
//! and [`time_smoother`] absorb network jitter and sender/receiver clock
//! drift, and [`playback`] hands the result to the host's audio engine.

pub mod config;
pub mod discovery;
pub mod error;
pub mod jitter_queue;
pub mod multicast;
pub mod playback;
pub mod reaper;
pub mod registry;
pub mod rtp;
pub mod sap;
pub mod session;
pub mod time_smoother;
pub mod utils;
