//! Update dispatcher: stop-driven fan-out, proxy push relay and interactive queries.

use crate::adapter::{AdapterError, Arch, DebuggerAdapter, MAX_MEMORY_READ};
use crate::proto::{ClientConfig, ClientKind, Message, Query, QueryValue, Response, UpdateData};
use serde_json::Value;
use crate::server::registry::{ClientId, ClientSender, Registry};
use crate::weak_error;
use itertools::Itertools;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, PoisonError};

/// Result of a single [`Dispatcher::update_clients`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Clients that received an update.
    pub delivered: usize,
    /// Clients skipped because their payload couldn't be built.
    pub skipped: usize,
    /// Clients purged because the send failed.
    pub purged: usize,
}

pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
    adapter: Arc<dyn DebuggerAdapter>,
    arch: Mutex<Option<Arch>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Mutex<Registry>>, adapter: Arc<dyn DebuggerAdapter>) -> Self {
        Self {
            registry,
            adapter,
            arch: Mutex::new(None),
        }
    }

    /// Architecture helper used by the last dispatch, if any.
    pub fn arch(&self) -> Option<Arch> {
        *self.arch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select the architecture helper for the current target, swapping it if the
    /// target architecture changed since the previous call (an `exec` in the debuggee).
    fn refresh_arch(&self) -> Result<Arch, AdapterError> {
        let arch = Arch::lookup(&self.adapter.arch()?)?;
        let mut current = self.arch.lock().unwrap_or_else(PoisonError::into_inner);
        match *current {
            Some(prev) if prev == arch => {}
            Some(prev) => info!("target architecture changed: {prev} -> {arch}"),
            None => debug!("target architecture: {arch}"),
        }
        *current = Some(arch);
        Ok(arch)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a client whose socket failed.
    fn purge(&self, id: ClientId) {
        if self.registry().purge(id) {
            info!("client {id} purged");
        }
    }

    /// Send a fresh update to every registered client that wants updates on stop.
    ///
    /// A client whose payload can't be built is skipped, a client whose socket fails is
    /// purged, neither stops the delivery to the rest.
    pub fn update_clients(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();

        if !self.adapter.has_target() {
            debug!("no target, update skipped");
            return stats;
        }

        let arch = match self.refresh_arch() {
            Ok(arch) => arch,
            Err(e) => {
                error!("update skipped: {e:#}");
                return stats;
            }
        };

        let targets: Vec<(ClientSender, ClientConfig)> = self
            .registry()
            .iter()
            .filter(|record| record.wants_stop_updates())
            .filter_map(|record| Some((record.sender().clone(), record.config()?.clone())))
            .collect();

        for (sender, config) in targets {
            let data = match build_payload(self.adapter.as_ref(), &config) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    warn!("client {} ({}): payload not built: {e:#}", sender.id(), config.kind);
                    stats.skipped += 1;
                    continue;
                }
            };

            let update = Message::Update {
                arch: Some(arch.to_string()),
                data,
            };
            match sender.send(&update) {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    warn!("client {}: send update: {e:#}", sender.id());
                    self.purge(sender.id());
                    stats.purged += 1;
                }
            }
        }

        debug!("update dispatched: {stats:?}");
        stats
    }

    /// Relay a proxy update to every registered client of `kind` except the sender,
    /// then acknowledge it to the sender. The payload is forwarded untouched.
    pub fn handle_push_update(&self, from: &ClientSender, kind: ClientKind, data: Value) {
        let targets = self
            .registry()
            .iter()
            .filter(|record| record.id() != from.id() && record.wants(kind))
            .map(|record| record.sender().clone())
            .collect_vec();

        let update = Message::Update {
            arch: None,
            data: UpdateData::Raw(data),
        };
        for sender in &targets {
            if let Err(e) = sender.send(&update) {
                warn!("client {}: relay push update: {e:#}", sender.id());
                self.purge(sender.id());
            }
        }
        debug!(
            "push update `{kind}` from {} relayed to {} client(s)",
            from.id(),
            targets.len()
        );

        if let Err(e) = from.send(&Message::Ack) {
            warn!("client {}: send ack: {e:#}", from.id());
            self.purge(from.id());
        }
    }

    /// Answer an interactive query to its sender only. Unsatisfiable queries are answered
    /// with an empty value.
    pub fn handle_interactive_query(&self, from: &ClientSender, query: Query) {
        let value = self.resolve(&query);
        debug!("client {} {query:?} -> {value:?}", from.id());

        if let Err(e) = from.send(&Message::Response(Response { value })) {
            warn!("client {}: send response: {e:#}", from.id());
            self.purge(from.id());
        }
    }

    fn resolve(&self, query: &Query) -> Option<QueryValue> {
        if !self.adapter.has_target() {
            return None;
        }
        weak_error!(self.refresh_arch(), "query:")?;

        match query {
            Query::GetRegister { register } => {
                crate::muted_error!(self.adapter.register(register)).map(QueryValue::Register)
            }
            Query::GetMemory { start, end } => {
                let len = memory_read_len(*start, *end)?;
                weak_error!(self.adapter.memory(*start, len)).map(QueryValue::Memory)
            }
        }
    }
}

/// Validated length of a `[start, end)` memory read.
fn memory_read_len(start: u64, end: u64) -> Option<usize> {
    let len = usize::try_from(end.checked_sub(start)?).ok()?;
    (len > 0 && len <= MAX_MEMORY_READ).then_some(len)
}

/// Build the payload a client of the given registration expects on stop.
fn build_payload(
    adapter: &dyn DebuggerAdapter,
    config: &ClientConfig,
) -> Result<Option<UpdateData>, AdapterError> {
    let data = match config.kind {
        ClientKind::Register => UpdateData::Registers {
            regs: adapter.registers()?,
            next_instruction: crate::muted_error!(adapter.next_instruction()),
        },
        ClientKind::Stack => UpdateData::Stack {
            data: adapter.stack()?,
            sp: adapter.sp()?,
        },
        ClientKind::Disasm => UpdateData::Disasm {
            disassembly: adapter.disasm()?,
        },
        ClientKind::Backtrace => UpdateData::Backtrace {
            backtrace: adapter.backtrace()?,
        },
        ClientKind::Cmd => {
            let Some(ref command) = config.command else {
                return Err(AdapterError::UnsupportedCommand("<none>".to_string()));
            };
            UpdateData::Command {
                output: adapter.cmd_output(command)?,
            }
        }
        ClientKind::Interactive => UpdateData::Stopped { pc: adapter.pc()? },
        ClientKind::View => return Ok(None),
    };
    Ok(Some(data))
}
