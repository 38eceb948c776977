//! Post-apply health check.

use crate::error::{AgentError, AgentResult};
use crate::runtime::ServiceRuntime;
use otter_core::config::HealthConfig;
use tokio::net::TcpStream;

/// Every required service reports "running" and the broker accepts a TCP
/// connection.
pub async fn check(runtime: &dyn ServiceRuntime, config: &HealthConfig) -> AgentResult<()> {
    let states = runtime
        .service_states()
        .await
        .map_err(|e| AgentError::HealthCheck(e.to_string()))?;

    let unhealthy: Vec<String> = config
        .required_services
        .iter()
        .filter_map(|service| match states.get(service).map(String::as_str) {
            Some("running") => None,
            Some(state) => Some(format!("{service} is {state}")),
            None => Some(format!("{service} is not deployed")),
        })
        .collect();
    if !unhealthy.is_empty() {
        return Err(AgentError::HealthCheck(unhealthy.join(", ")));
    }

    if let Some(addr) = &config.broker_addr {
        match tokio::time::timeout(config.broker_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(AgentError::HealthCheck(format!(
                    "broker {addr} unreachable: {e}"
                )));
            }
            Err(_) => {
                return Err(AgentError::HealthCheck(format!(
                    "broker {addr} did not answer within {}ms",
                    config.broker_timeout_ms
                )));
            }
        }
    }

    tracing::debug!(services = config.required_services.len(), "Health check passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct FixedStates(BTreeMap<String, String>);

    #[async_trait]
    impl ServiceRuntime for FixedStates {
        async fn pull(&self, _image: &str) -> AgentResult<()> {
            Ok(())
        }
        async fn stop(&self) -> AgentResult<()> {
            Ok(())
        }
        async fn start(&self) -> AgentResult<()> {
            Ok(())
        }
        async fn service_states(&self) -> AgentResult<BTreeMap<String, String>> {
            Ok(self.0.clone())
        }
        async fn exec(&self, _program: &str, _args: &[String]) -> AgentResult<()> {
            Ok(())
        }
    }

    fn runtime(states: &[(&str, &str)]) -> FixedStates {
        FixedStates(
            states
                .iter()
                .map(|(s, st)| (s.to_string(), st.to_string()))
                .collect(),
        )
    }

    fn config(required: &[&str], broker: Option<String>) -> HealthConfig {
        HealthConfig {
            required_services: required.iter().map(|s| s.to_string()).collect(),
            broker_addr: broker,
            broker_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_all_running_with_live_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let rt = runtime(&[("api", "running"), ("worker", "running")]);
        check(&rt, &config(&["api", "worker"], Some(addr))).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_or_missing_service_fails() {
        let rt = runtime(&[("api", "running"), ("worker", "exited")]);
        let err = check(&rt, &config(&["api", "worker", "mqtt"], None))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("worker is exited"), "{msg}");
        assert!(msg.contains("mqtt is not deployed"), "{msg}");
    }

    #[tokio::test]
    async fn test_dead_broker_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let rt = runtime(&[("api", "running")]);
        let err = check(&rt, &config(&["api"], Some(addr))).await.unwrap_err();
        assert!(matches!(err, AgentError::HealthCheck(_)));
    }
}
