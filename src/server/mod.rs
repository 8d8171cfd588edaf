#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

use crate::{Service, config::Interface};

use anyhow::Result;
use service::Error;

/// Upper bound of one STUN message or ChannelData frame, anything larger is
/// treated as garbage.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Bind every configured interface and serve it until its listener fails.
pub async fn start_server(interfaces: Vec<Interface>, service: Service) -> Result<()> {
    let mut listeners = tokio::task::JoinSet::new();

    for interface in interfaces {
        let service = service.clone();

        #[allow(unreachable_patterns)]
        match interface.transport {
            #[cfg(feature = "udp")]
            crate::config::Transport::Udp => {
                let listener = udp::bind(interface).await?;
                listeners.spawn(listener.serve(service));
            }
            #[cfg(feature = "tcp")]
            crate::config::Transport::Tcp => {
                let listener = tcp::bind(interface).await?;
                listeners.spawn(listener.serve(service));
            }
            transport => {
                log::warn!("transport is not enabled in this build: transport={transport:?}");
            }
        }
    }

    if let Some(res) = listeners.join_next().await {
        listeners.abort_all();

        return res?;
    }

    Ok(())
}

/// Report the outcome of one routed message. Protocol failures were already
/// answered, they only show up in the debug log.
pub(crate) fn report(ret: Result<(), Error>, address: std::net::SocketAddr) {
    match ret {
        Ok(()) => (),
        Err(Error::Transport(e)) => {
            log::warn!("failed to reach client: addr={address}, err={e}");
        }
        Err(e) => {
            log::debug!("request rejected: addr={address}, err={e}");
        }
    }
}
