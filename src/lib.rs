pub mod config;
pub mod handler;
pub mod server;

use self::{config::Config, handler::Handler};

use service::{ServiceOptions, allocation::ports::PortRangeAllocator};
use tokio::task::JoinSet;

pub type Service = service::Service<Handler>;

/// Build the turn service described by the configuration.
pub fn make_service(config: &Config) -> Service {
    service::Service::new(ServiceOptions {
        realm: config.server.realm.clone(),
        software: config.server.software.clone(),
        max_allocations: config.server.max_allocations,
        channel_binding_lifetime: config.server.channel_binding_lifetime(),
        nonce_lifetime: config.server.nonce_lifetime(),
        allocator: Box::new(PortRangeAllocator::new(
            config.relay.port_range,
            config.relay.listen,
            config.relay.external(),
        )),
        handler: Handler::new(config.auth.clone()),
    })
}

/// In order to let the integration test directly use the turn-relay crate and
/// start the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let service = make_service(&config);

    let mut workers = JoinSet::new();
    workers.spawn(server::start_server(
        config.server.interfaces.clone(),
        service.clone(),
    ));

    {
        let sweeper = service.sweeper(config.server.sweep_interval());
        workers.spawn(async move {
            sweeper.await;
            anyhow::Ok(())
        });
    }

    if let Some(res) = workers.join_next().await {
        workers.abort_all();

        return res?;
    }

    Ok(())
}
