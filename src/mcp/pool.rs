//! Connection pool keyed by user ID.
//!
//! Each user's [`UserSessionSet`] is created lazily on first lookup and torn
//! down by the idle sweeper, an OAuth callback, reconfiguration or shutdown.
//! Remote I/O never runs while the pool lock is held: connecting happens
//! through a per-user `OnceCell` and teardown after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use rust_mcp_schema::CallToolResult;
use serde_json::{Map, Value};
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::store::OAuthSession;
use crate::auth::AuthManager;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::PoolConfig;
use crate::core::error::{McpError, McpResult, ValidationError};
use crate::core::store::KvStore;
use crate::mcp::client::{build_http_client, HttpConnector};
use crate::mcp::session::SessionContext;
use crate::mcp::tool::Tool;
use crate::mcp::transport::Connector;
use crate::mcp::user_sessions::{ConnectionErrors, UserSessionSet};

/// What a tool lookup returns: every tool that connected, plus whatever went
/// wrong elsewhere.
#[derive(Debug, Clone)]
pub struct UserTools {
    pub tools: Vec<Tool>,
    pub errors: Option<ConnectionErrors>,
}

impl UserTools {
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }
}

struct Generation {
    config: PoolConfig,
    context: SessionContext,
}

#[derive(Default)]
struct UserSlot {
    set: OnceCell<Arc<UserSessionSet>>,
}

struct PoolState {
    generation: Arc<Generation>,
    users: HashMap<String, Arc<UserSlot>>,
    last_activity: HashMap<String, DateTime<Utc>>,
    shut_down: bool,
}

struct PoolInner {
    state: RwLock<PoolState>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    /// A pool that dials servers over streamable HTTP on the system clock.
    pub fn new(config: PoolConfig, kv: Arc<dyn KvStore>) -> McpResult<Self> {
        let http = build_http_client(&config)?;
        let connector = Arc::new(HttpConnector::new(http.clone()));
        Self::with_collaborators(config, kv, Arc::new(SystemClock), http, connector)
    }

    pub fn with_collaborators(
        config: PoolConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
        connector: Arc<dyn Connector>,
    ) -> McpResult<Self> {
        config
            .validate()
            .map_err(|err| McpError::Config(err.to_string()))?;
        let generation = new_generation(config, &kv, &clock, &http, &connector);
        Ok(Self {
            inner: Arc::new(PoolInner {
                state: RwLock::new(PoolState {
                    generation,
                    users: HashMap::new(),
                    last_activity: HashMap::new(),
                    shut_down: false,
                }),
                kv,
                clock,
                http,
                connector,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Tools for `user_id`, connecting that user's servers on first use.
    /// Connection errors are sticky until the user's sessions are evicted or
    /// their authorization URLs expire.
    pub async fn get_tools_for_user(&self, user_id: &str) -> McpResult<UserTools> {
        let set = self.inner.user_set(user_id).await?;
        Ok(UserTools {
            tools: set.tools().await,
            errors: set.errors().cloned(),
        })
    }

    pub async fn call_tool(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<CallToolResult> {
        let set = self.inner.user_set(user_id).await?;
        set.call_tool(tool_name, arguments).await
    }

    /// Completes an authorization flow, then drops the user's sessions so the
    /// next lookup reconnects with the new token. An expired flow also drops
    /// them, so the next lookup starts a fresh one.
    pub async fn process_oauth_callback(
        &self,
        user_id: &str,
        state: &str,
        code: &str,
    ) -> McpResult<OAuthSession> {
        let generation = self.inner.current_generation().await?;
        match generation
            .context
            .auth
            .process_callback(user_id, state, code)
            .await
        {
            Ok(session) => {
                self.evict_user(user_id).await;
                Ok(session)
            }
            Err(err @ McpError::Validation(ValidationError::SessionExpired)) => {
                // The URL the user followed is dead; reconnecting mints a new one.
                self.evict_user(user_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Closes and forgets one user's sessions. Returns whether any existed.
    pub async fn evict_user(&self, user_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.write().await;
            state.last_activity.remove(user_id);
            state.users.remove(user_id)
        };
        match removed {
            Some(slot) => {
                if let Some(set) = slot.set.get() {
                    set.close().await;
                }
                debug!(user_id = %user_id, "Evicted MCP sessions");
                true
            }
            None => false,
        }
    }

    /// Evicts every user idle longer than the configured timeout. Returns
    /// the number of users evicted.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Replaces the configuration wholesale. Every open session is closed.
    pub async fn reconfigure(&self, config: PoolConfig) -> McpResult<()> {
        config
            .validate()
            .map_err(|err| McpError::Config(err.to_string()))?;
        let generation = self.inner.generation(config);
        let drained = {
            let mut state = self.inner.state.write().await;
            if state.shut_down {
                return Err(McpError::PoolShutdown);
            }
            state.generation = generation;
            state.last_activity.clear();
            std::mem::take(&mut state.users)
        };
        let closed = close_slots(drained.into_values()).await;
        info!(closed, "MCP pool reconfigured");
        Ok(())
    }

    /// Stops the sweeper and closes every session. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained = {
            let mut state = self.inner.state.write().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.last_activity.clear();
            std::mem::take(&mut state.users)
        };
        let closed = close_slots(drained.into_values()).await;
        info!(closed, "MCP pool shut down");
    }

    pub async fn active_users(&self) -> usize {
        self.inner.state.read().await.users.len()
    }

    /// Spawns the periodic idle sweep. It stops on [`Self::shutdown`] or once
    /// every handle to the pool is dropped.
    pub async fn start_sweeper(&self) -> JoinHandle<()> {
        let period = self
            .inner
            .state
            .read()
            .await
            .generation
            .config
            .sweep_interval();
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        pool.sweep_idle().await;
                    }
                }
            }
            debug!("MCP idle sweeper stopped");
        })
    }
}

impl PoolInner {
    fn generation(&self, config: PoolConfig) -> Arc<Generation> {
        new_generation(config, &self.kv, &self.clock, &self.http, &self.connector)
    }

    async fn current_generation(&self) -> McpResult<Arc<Generation>> {
        let state = self.state.read().await;
        if state.shut_down {
            return Err(McpError::PoolShutdown);
        }
        Ok(Arc::clone(&state.generation))
    }

    async fn user_set(&self, user_id: &str) -> McpResult<Arc<UserSessionSet>> {
        loop {
            let (slot, generation) = self.slot(user_id).await?;
            let existing = slot.set.initialized();
            let set = slot
                .set
                .get_or_init(|| async {
                    Arc::new(
                        UserSessionSet::connect_all(
                            user_id,
                            &generation.config.servers,
                            &generation.context,
                        )
                        .await,
                    )
                })
                .await
                .clone();

            if existing && set.authorizations_expired(self.clock.now()) {
                self.retire(user_id, &slot).await;
                set.close().await;
                info!(user_id = %user_id, "Pending MCP authorizations expired; reconnecting");
                continue;
            }
            if self.touch(user_id, &slot).await {
                return Ok(set);
            }
            // Evicted while connecting; nobody else will close this set.
            set.close().await;
            debug!(user_id = %user_id, "MCP sessions evicted during connect; retrying");
        }
    }

    async fn slot(&self, user_id: &str) -> McpResult<(Arc<UserSlot>, Arc<Generation>)> {
        {
            let state = self.state.read().await;
            if state.shut_down {
                return Err(McpError::PoolShutdown);
            }
            if let Some(slot) = state.users.get(user_id) {
                return Ok((Arc::clone(slot), Arc::clone(&state.generation)));
            }
        }

        let now = self.clock.now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.shut_down {
            return Err(McpError::PoolShutdown);
        }
        let slot = Arc::clone(state.users.entry(user_id.to_string()).or_default());
        state.last_activity.entry(user_id.to_string()).or_insert(now);
        Ok((slot, Arc::clone(&state.generation)))
    }

    /// Refreshes last activity if `slot` is still the user's current slot.
    async fn touch(&self, user_id: &str, slot: &Arc<UserSlot>) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let current = state
            .users
            .get(user_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if current {
            state.last_activity.insert(user_id.to_string(), now);
        }
        current
    }

    /// Forgets `slot` if it is still the user's current slot.
    async fn retire(&self, user_id: &str, slot: &Arc<UserSlot>) {
        let mut state = self.state.write().await;
        let current = state
            .users
            .get(user_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if current {
            state.users.remove(user_id);
            state.last_activity.remove(user_id);
        }
    }

    async fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let evicted: Vec<(String, Arc<UserSlot>)> = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let idle_timeout = state.generation.config.idle_timeout();
            let idle: Vec<String> = state
                .users
                .iter()
                .filter(|(user_id, slot)| {
                    slot.set.initialized()
                        && state.last_activity.get(*user_id).is_none_or(|last| {
                            now.signed_duration_since(*last) > idle_timeout
                        })
                })
                .map(|(user_id, _)| user_id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|user_id| {
                    state.last_activity.remove(&user_id);
                    state.users.remove(&user_id).map(|slot| (user_id, slot))
                })
                .collect()
        };

        for (user_id, slot) in &evicted {
            if let Some(set) = slot.set.get() {
                debug!(user_id = %user_id, "Closing idle MCP sessions");
                set.close().await;
            }
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Evicted idle MCP users");
        }
        evicted.len()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn new_generation(
    config: PoolConfig,
    kv: &Arc<dyn KvStore>,
    clock: &Arc<dyn Clock>,
    http: &reqwest::Client,
    connector: &Arc<dyn Connector>,
) -> Arc<Generation> {
    let auth = AuthManager::new(
        config.oauth.clone(),
        Arc::clone(kv),
        Arc::clone(clock),
        http.clone(),
    );
    let context = SessionContext {
        connector: Arc::clone(connector),
        auth: Arc::new(auth),
        user_id_header: config.user_id_header.clone(),
    };
    Arc::new(Generation { config, context })
}

async fn close_slots(slots: impl Iterator<Item = Arc<UserSlot>>) -> usize {
    let mut closed = 0;
    for slot in slots {
        if let Some(set) = slot.set.get() {
            set.close().await;
            closed += 1;
        }
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, ValidationError};
    use crate::mcp::test_support::{text_of, Behaviour, Fixture};
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn pool(fixture: &Fixture) -> ClientPool {
        ClientPool::with_collaborators(
            fixture.pool_config(),
            fixture.kv.clone(),
            Arc::new(fixture.clock.clone()),
            reqwest::Client::new(),
            fixture.connector.clone(),
        )
        .expect("pool")
    }

    #[tokio::test]
    async fn lookups_reuse_one_session_set() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);

        let (first, second) = tokio::join!(
            pool.get_tools_for_user("alice"),
            pool.get_tools_for_user("alice")
        );
        assert_eq!(first.expect("first").tools.len(), 1);
        assert_eq!(second.expect("second").tools.len(), 1);
        pool.get_tools_for_user("alice").await.expect("third");

        assert_eq!(fixture.connector.requests().len(), 1);
        assert_eq!(pool.active_users().await, 1);
    }

    #[tokio::test]
    async fn users_never_share_sessions() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);

        pool.get_tools_for_user("alice").await.expect("alice");
        pool.get_tools_for_user("bob").await.expect("bob");

        let mut users: Vec<_> = fixture
            .connector
            .requests()
            .into_iter()
            .map(|request| request.user_id)
            .collect();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);
        assert_eq!(fixture.connector.connections_for("docs").len(), 2);
    }

    #[tokio::test]
    async fn idle_users_are_evicted_and_closed_once() {
        let fixture = Fixture::new()
            .with("docs", Behaviour::tools(&["search"]))
            .with("wiki", Behaviour::tools(&["lookup"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");

        fixture.clock.advance(Duration::minutes(30) + Duration::seconds(1));
        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(pool.sweep_idle().await, 0);
        assert_eq!(pool.active_users().await, 0);

        let connections = fixture.connector.all_connections();
        assert_eq!(connections.len(), 2);
        assert!(connections
            .iter()
            .all(|connection| connection.close_calls() == 1));

        pool.get_tools_for_user("alice").await.expect("reconnect");
        assert_eq!(fixture.connector.all_connections().len(), 4);
    }

    #[tokio::test]
    async fn activity_postpones_eviction() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");

        fixture.clock.advance(Duration::minutes(20));
        pool.get_tools_for_user("alice").await.expect("tools");
        fixture.clock.advance(Duration::minutes(20));

        assert_eq!(pool.sweep_idle().await, 0);
        assert_eq!(pool.active_users().await, 1);
    }

    #[tokio::test]
    async fn connection_errors_are_sticky() {
        let fixture = Fixture::new()
            .with("docs", Behaviour::tools(&["search"]))
            .with("calendar", Behaviour::Unauthorized);
        fixture.register_client("calendar").await;
        let pool = pool(&fixture);

        for _ in 0..2 {
            let tools = pool.get_tools_for_user("alice").await.expect("tools");
            assert_eq!(tools.tools.len(), 1);
            let errors = tools.errors.expect("auth error kept");
            assert_eq!(errors.auth_errors.len(), 1);
            assert_eq!(errors.auth_errors[0].server_name, "calendar");
        }
    }

    #[tokio::test]
    async fn eviction_lets_a_newly_authorized_server_connect() {
        let fixture = Fixture::new().with("calendar", Behaviour::Unauthorized);
        fixture.register_client("calendar").await;
        let pool = pool(&fixture);

        let first = pool.get_tools_for_user("alice").await.expect("lookup");
        assert!(first.tools.is_empty());

        fixture.connector.set("calendar", Behaviour::tools(&["events"]));
        assert!(pool.evict_user("alice").await);
        let second = pool.get_tools_for_user("alice").await.expect("lookup");
        assert_eq!(second.tools.len(), 1);
        assert!(second.errors.is_none());
    }

    fn auth_state(tools: &UserTools) -> (String, String) {
        let auth_url = tools.errors.as_ref().expect("errors").auth_errors[0]
            .auth_url
            .clone();
        let state = reqwest::Url::parse(&auth_url)
            .expect("authorization URL")
            .query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .expect("state parameter");
        (auth_url, state)
    }

    #[tokio::test]
    async fn expired_authorization_url_is_replaced_on_lookup() {
        let fixture = Fixture::new()
            .with("docs", Behaviour::tools(&["search"]))
            .with("calendar", Behaviour::Unauthorized);
        fixture.register_client("calendar").await;
        let pool = pool(&fixture);

        let (first_url, _) = auth_state(&pool.get_tools_for_user("alice").await.expect("lookup"));
        for _ in 0..3 {
            fixture.clock.advance(Duration::minutes(4));
            let (url, _) = auth_state(&pool.get_tools_for_user("alice").await.expect("lookup"));
            assert_eq!(url, first_url);
        }

        fixture.clock.advance(Duration::minutes(4));
        let tools = pool.get_tools_for_user("alice").await.expect("lookup");
        let (fresh_url, fresh_state) = auth_state(&tools);
        assert_ne!(fresh_url, first_url);
        assert_eq!(tools.tools.len(), 1);
        assert!(fixture
            .auth
            .credential_store()
            .session("alice", &fresh_state)
            .await
            .expect("read session")
            .is_some());
        assert_eq!(pool.active_users().await, 1);
        assert_eq!(fixture.connector.connections_for("docs")[0].close_calls(), 1);
    }

    #[tokio::test]
    async fn expired_callback_drops_sessions_for_a_fresh_url() {
        let fixture = Fixture::new().with("calendar", Behaviour::Unauthorized);
        fixture.register_client("calendar").await;
        let pool = pool(&fixture);

        let (first_url, state) = auth_state(&pool.get_tools_for_user("alice").await.expect("lookup"));
        fixture.clock.advance(Duration::minutes(16));
        let err = pool
            .process_oauth_callback("alice", &state, "code")
            .await
            .expect_err("expired");
        assert!(matches!(
            err,
            McpError::Validation(ValidationError::SessionExpired)
        ));
        assert_eq!(pool.active_users().await, 0);

        let (fresh_url, _) = auth_state(&pool.get_tools_for_user("alice").await.expect("lookup"));
        assert_ne!(fresh_url, first_url);
    }

    #[tokio::test]
    async fn failed_callback_keeps_sessions() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");

        let err = pool
            .process_oauth_callback("alice", "unknown-state", "code")
            .await
            .expect_err("no session");
        assert!(matches!(
            err,
            McpError::Validation(ValidationError::SessionNotFound)
        ));
        assert_eq!(pool.active_users().await, 1);
    }

    #[tokio::test]
    async fn call_tool_dispatches_to_owner() {
        let fixture = Fixture::new()
            .with("docs", Behaviour::tools(&["search"]))
            .with("wiki", Behaviour::tools(&["lookup"]));
        let pool = pool(&fixture);

        let result = pool
            .call_tool("alice", "lookup", None)
            .await
            .expect("call");
        assert_eq!(text_of(&result), "wiki:lookup");
    }

    #[tokio::test]
    async fn reconfigure_closes_everything_and_uses_new_servers() {
        let fixture = Fixture::new()
            .with("docs", Behaviour::tools(&["search"]))
            .with("wiki", Behaviour::tools(&["lookup"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");

        let mut config = fixture.pool_config();
        config.servers.retain(|server| server.name == "wiki");
        pool.reconfigure(config).await.expect("reconfigure");
        assert_eq!(pool.active_users().await, 0);
        assert!(fixture
            .connector
            .all_connections()
            .iter()
            .all(|connection| connection.close_calls() == 1));

        let tools = pool.get_tools_for_user("alice").await.expect("tools");
        let names: Vec<_> = tools.tools.iter().map(|tool| tool.name()).collect();
        assert_eq!(names, vec!["lookup"]);
    }

    #[tokio::test]
    async fn reconfigure_rejects_invalid_config() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);

        let mut config = fixture.pool_config();
        config.servers.push(config.servers[0].clone());
        let err = pool.reconfigure(config).await.expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(fixture.connector.connections_for("docs")[0].close_calls(), 1);
        assert!(matches!(
            pool.get_tools_for_user("alice").await,
            Err(McpError::PoolShutdown)
        ));
        assert!(matches!(
            pool.reconfigure(fixture.pool_config()).await,
            Err(McpError::PoolShutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_tick_evicts_idle_users() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);
        pool.get_tools_for_user("alice").await.expect("tools");
        fixture.clock.advance(Duration::minutes(31));

        let handle = pool.start_sweeper().await;
        let period = fixture.pool_config().sweep_interval();
        tokio::time::sleep(period / 2).await;
        assert_eq!(pool.active_users().await, 1);

        tokio::time::sleep(period).await;
        assert_eq!(pool.active_users().await, 0);
        assert_eq!(fixture.connector.connections_for("docs")[0].close_calls(), 1);

        pool.shutdown().await;
        handle.await.expect("sweeper task");
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let fixture = Fixture::new().with("docs", Behaviour::tools(&["search"]));
        let pool = pool(&fixture);
        let handle = pool.start_sweeper().await;

        pool.shutdown().await;
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("sweeper exits")
            .expect("sweeper task");
    }
}
