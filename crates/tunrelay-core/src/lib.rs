//! Connection relay engine for traffic captured off a TUN-style interface.
//!
//! A network stack hands captured connections ([`adapter::TcpConn`],
//! [`adapter::UdpConn`]) to a [`tunnel::Tunnel`], which dials an upstream
//! through a [`proxy::Dialer`], wraps it for accounting with a
//! [`tracker::Tracker`] and pumps bytes with a [`relay::Relay`].

pub mod adapter;
pub mod config;
pub mod metadata;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod stats;
pub mod tracker;
pub mod tunnel;
