use std::{io, sync::Arc};

use common::{Address, DefaultDispatcher, Destination, Dispatcher, OutboundHandler, Router};
use direct::{DokodemoServer, Freedom};
use log::{info, warn};
use socks::SocksServer;
use tokio::{net::TcpListener, task::JoinSet};
use vmess::{Security, User, Validator, VmessClient, VmessServer, ID};

use crate::config::{Config, ConfigError, InboundProtocol, OutboundProtocol, RoutingRule};

/// Picks an outbound by domain suffix.
pub struct DomainRouter {
    rules: Vec<RoutingRule>,
}

impl DomainRouter {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }
}

impl Router for DomainRouter {
    fn pick_route(&self, destination: &Destination) -> Option<String> {
        let Address::DomainName(host, _) = &destination.address else {
            return None;
        };
        self.rules
            .iter()
            .find(|rule| {
                host == &rule.domain
                    || host
                        .strip_suffix(rule.domain.as_str())
                        .map_or(false, |rest| rest.ends_with('.'))
            })
            .map(|rule| rule.outbound.clone())
    }
}

enum Inbound {
    Socks,
    Dokodemo(Arc<DokodemoServer>),
    Vmess(Arc<VmessServer>),
}

struct Listener {
    tag: String,
    addr: String,
    inbound: Inbound,
}

/// Every handler built from one config, ready to listen.
pub struct Registry {
    dispatcher: Arc<dyn Dispatcher>,
    listeners: Vec<Listener>,
}

fn build_outbound(protocol: &OutboundProtocol) -> Result<Arc<dyn OutboundHandler>, ConfigError> {
    let handler: Arc<dyn OutboundHandler> = match protocol {
        OutboundProtocol::Freedom => Arc::new(Freedom),
        OutboundProtocol::Vmess(settings) => {
            let security = settings
                .security
                .parse::<Security>()
                .map_err(|_| ConfigError::Security(settings.security.clone()))?;
            Arc::new(VmessClient::new(
                Address::from_host(&settings.address, settings.port),
                ID::new(settings.id),
                security,
            ))
        }
    };
    Ok(handler)
}

impl Registry {
    pub fn build(config: &Config) -> Result<Self, ConfigError> {
        let (first, rest) = config
            .outbounds
            .split_first()
            .ok_or(ConfigError::NoOutbound)?;

        let default = build_outbound(&first.protocol)?;
        let mut dispatcher = DefaultDispatcher::new(default.clone());
        if let Some(tag) = &first.tag {
            dispatcher = dispatcher.with_handler(tag.clone(), default);
        }
        for outbound in rest {
            match &outbound.tag {
                Some(tag) => {
                    dispatcher =
                        dispatcher.with_handler(tag.clone(), build_outbound(&outbound.protocol)?);
                }
                None => warn!("untagged outbound after the first one is unreachable"),
            }
        }
        if !config.routing.is_empty() {
            let router = DomainRouter::new(config.routing.clone());
            dispatcher = dispatcher.with_router(Arc::new(router));
        }
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);

        let mut listeners = Vec::with_capacity(config.inbounds.len());
        for (i, inbound) in config.inbounds.iter().enumerate() {
            let built = match &inbound.protocol {
                InboundProtocol::Socks => Inbound::Socks,
                InboundProtocol::DokodemoDoor(settings) => {
                    let destination =
                        Destination::tcp(Address::from_host(&settings.address, settings.port));
                    Inbound::Dokodemo(Arc::new(DokodemoServer::new(
                        destination,
                        dispatcher.clone(),
                    )))
                }
                InboundProtocol::Vmess(settings) => {
                    let validator = Arc::new(Validator::with_clock(
                        Arc::new(vmess::clock::SystemClock),
                        config.replay_window,
                    ));
                    for account in &settings.clients {
                        let user = User::new(account.id, account.level, account.email.clone());
                        validator.add_account(user);
                    }
                    Inbound::Vmess(Arc::new(VmessServer::new(validator, dispatcher.clone())))
                }
            };
            listeners.push(Listener {
                tag: inbound.tag.clone().unwrap_or_else(|| format!("inbound-{}", i)),
                addr: inbound.listen_addr(),
                inbound: built,
            });
        }

        Ok(Self {
            dispatcher,
            listeners,
        })
    }

    /// Binds every inbound and serves until one of them fails.
    pub async fn run(self) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        for listener in self.listeners {
            info!("starting inbound {} on {}", listener.tag, listener.addr);
            match listener.inbound {
                Inbound::Socks => {
                    let mut server =
                        SocksServer::new(&listener.addr, self.dispatcher.clone()).await?;
                    tasks.spawn(async move { server.serve().await });
                }
                Inbound::Dokodemo(server) => {
                    let tcp = TcpListener::bind(&listener.addr).await?;
                    tasks.spawn(server.serve(tcp));
                }
                Inbound::Vmess(server) => {
                    let tcp = TcpListener::bind(&listener.addr).await?;
                    tasks.spawn(server.serve(tcp));
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
        Ok(())
    }
}
