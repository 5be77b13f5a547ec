//! Startup self-registration
//!
//! Fetches this agent's record, settles the bind and advertise addresses
//! against the host, and writes them back when they changed.

use std::time::Duration;

use tokio::time::Instant;

use cp_core::traits::AgentAddrUpdate;
use cp_core::{ControlPlane, RegisterError};
use cp_models::ProxyAgent;

use crate::backoff::FibonacciBackoff;
use crate::netutil::HostAddrs;

/// Unit of the Fibonacci retry sequence
const FETCH_RETRY_UNIT: Duration = Duration::from_secs(1);

/// Addresses the agent runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub bind_addr: String,
    pub advertise_addr: String,
}

/// Register this agent with the control plane.
///
/// The record fetch is retried with Fibonacci backoff until `init_wait`
/// would be exceeded. Failing to find a bind address is fatal.
pub async fn register(
    api: &dyn ControlPlane,
    agent_id: &str,
    init_wait: Duration,
    host: &dyn HostAddrs,
) -> Result<Registration, RegisterError> {
    let agent = fetch_agent(api, agent_id, init_wait).await?;
    let registration = settle_addresses(&agent, host)?;

    if registration.bind_addr != agent.bind_addr
        || registration.advertise_addr != agent.advertise_addr
    {
        tracing::info!(
            bind_addr = %registration.bind_addr,
            advertise_addr = %registration.advertise_addr,
            "Updating proxy agent addresses"
        );
        let update = AgentAddrUpdate {
            bind_addr: registration.bind_addr.clone(),
            advertise_addr: registration.advertise_addr.clone(),
        };
        api.update_agent(agent_id, &update)
            .await
            .map_err(|source| RegisterError::Update {
                id: agent_id.to_string(),
                source,
            })?;
    }

    tracing::info!(
        agent_id,
        bind_addr = %registration.bind_addr,
        advertise_addr = %registration.advertise_addr,
        "Proxy agent registered"
    );
    Ok(registration)
}

async fn fetch_agent(
    api: &dyn ControlPlane,
    agent_id: &str,
    init_wait: Duration,
) -> Result<ProxyAgent, RegisterError> {
    let deadline = Instant::now() + init_wait;
    let mut backoff = FibonacciBackoff::new(FETCH_RETRY_UNIT, init_wait.max(FETCH_RETRY_UNIT));
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match api.get_agent(agent_id).await {
            Ok(agent) => return Ok(agent),
            Err(e) => {
                let delay = backoff.next_delay();
                if Instant::now() + delay > deadline {
                    return Err(RegisterError::FetchAgent {
                        id: agent_id.to_string(),
                        attempts,
                        source: e,
                    });
                }
                tracing::warn!(agent_id, attempts, error = %e, ?delay, "Failed to fetch proxy agent, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Decide the bind and advertise addresses from the record and the host
fn settle_addresses(
    agent: &ProxyAgent,
    host: &dyn HostAddrs,
) -> Result<Registration, RegisterError> {
    let bind_addr = if !agent.bind_addr.is_empty() && host.is_local(&agent.bind_addr) {
        agent.bind_addr.clone()
    } else {
        if !agent.bind_addr.is_empty() {
            tracing::warn!(bind_addr = %agent.bind_addr, "Recorded bind address is not on this host");
        }
        host.primary_ipv4()
            .map_err(|e| RegisterError::BindDiscovery(e.to_string()))?
            .to_string()
    };
    let bind_changed = bind_addr != agent.bind_addr;

    let advertise_addr = if agent.advertise_addr.is_empty()
        || (bind_changed && agent.advertise_addr == agent.bind_addr)
    {
        bind_addr.clone()
    } else {
        agent.advertise_addr.clone()
    };

    Ok(Registration {
        bind_addr,
        advertise_addr,
    })
}
