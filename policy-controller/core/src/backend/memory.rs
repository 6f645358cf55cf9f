use super::{Backend, BackendError, LogicalSwitch, Op, Row};
use crate::{acl::Acl, port_group::PortGroup};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// An in-process backend with fault injection.
///
/// Rows are kept in memory; transactions are applied to a copy of the state and only swapped in
/// once every operation has been validated.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

#[derive(Clone, Debug, Default)]
struct State {
    /// ACLs by UUID.
    acls: BTreeMap<String, Acl>,
    /// Port groups by name.
    port_groups: BTreeMap<String, Row<PortGroup>>,
    /// Logical switches by name.
    switches: BTreeMap<String, Row<LogicalSwitch>>,
    next_uuid: u64,
    connected: bool,
    fail_next: usize,
    commits: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                connected: true,
                ..State::default()
            }),
        }
    }

    /// Inserts an ACL row directly, bypassing transactions, and returns its UUID.
    pub fn insert_acl(&self, acl: Acl) -> String {
        let mut state = self.state.lock();
        let uuid = state.allocate_uuid();
        state.acls.insert(uuid.clone(), acl);
        uuid
    }

    /// Inserts a port group row directly, bypassing transactions, and returns its UUID.
    pub fn insert_port_group(&self, pg: PortGroup) -> String {
        let mut state = self.state.lock();
        let uuid = state.allocate_uuid();
        state.port_groups.insert(
            pg.name.clone(),
            Row {
                uuid: uuid.clone(),
                row: pg,
            },
        );
        uuid
    }

    /// Creates an empty logical switch, as node management would, and returns its UUID.
    pub fn insert_switch(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let uuid = state.allocate_uuid();
        state.switches.insert(
            name.to_string(),
            Row {
                uuid: uuid.clone(),
                row: LogicalSwitch {
                    name: name.to_string(),
                    acls: Default::default(),
                },
            },
        );
        uuid
    }

    pub fn switch(&self, name: &str) -> Option<LogicalSwitch> {
        self.state.lock().switches.get(name).map(|r| r.row.clone())
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Fails the next `n` transactions with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// The number of committed transactions.
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn acls(&self) -> Vec<Row<Acl>> {
        self.state
            .lock()
            .acls
            .iter()
            .map(|(uuid, acl)| Row {
                uuid: uuid.clone(),
                row: acl.clone(),
            })
            .collect()
    }

    pub fn acl(&self, uuid: &str) -> Option<Acl> {
        self.state.lock().acls.get(uuid).cloned()
    }

    pub fn acl_by_name(&self, name: &str) -> Option<Row<Acl>> {
        self.acls().into_iter().find(|r| r.row.name == name)
    }

    pub fn port_groups(&self) -> Vec<Row<PortGroup>> {
        self.state.lock().port_groups.values().cloned().collect()
    }

    pub fn port_group(&self, name: &str) -> Option<PortGroup> {
        self.state
            .lock()
            .port_groups
            .get(name)
            .map(|r| r.row.clone())
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn transact(&self, ops: Vec<Op>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BackendError::Disconnected);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BackendError::Disconnected);
        }

        let mut next = state.clone();
        let n = ops.len();
        for op in ops {
            next.apply(op)?;
        }
        next.validate()?;
        next.commits += 1;
        *state = next;
        tracing::trace!(ops = n, "Committed transaction");
        Ok(())
    }

    async fn list_acls(&self) -> Result<Vec<Row<Acl>>, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        Ok(self.acls())
    }

    async fn list_port_groups(&self) -> Result<Vec<Row<PortGroup>>, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        Ok(self.port_groups())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

// === impl State ===

impl State {
    fn allocate_uuid(&mut self) -> String {
        self.next_uuid += 1;
        format!("00000000-0000-0000-0000-{:012x}", self.next_uuid)
    }

    fn apply(&mut self, op: Op) -> Result<(), BackendError> {
        match op {
            Op::UpsertAcl(acl) => {
                let existing = acl.key().and_then(|key| {
                    self.acls
                        .iter()
                        .find(|(_, a)| a.key() == Some(key))
                        .map(|(uuid, _)| uuid.clone())
                });
                let uuid = match existing {
                    Some(uuid) => uuid,
                    None => self.allocate_uuid(),
                };
                self.acls.insert(uuid, acl);
            }

            Op::UpdateAcl { uuid, acl } => match self.acls.get_mut(&uuid) {
                Some(row) => *row = acl,
                None => {
                    return Err(BackendError::Constraint(format!(
                        "ACL {uuid} does not exist"
                    )))
                }
            },

            Op::UpsertPortGroup(pg) => match self.port_groups.get_mut(&pg.name) {
                Some(row) => row.row = pg,
                None => {
                    let uuid = self.allocate_uuid();
                    self.port_groups
                        .insert(pg.name.clone(), Row { uuid, row: pg });
                }
            },

            Op::AddAclsToSwitch { switch, acls } => match self.switches.get_mut(&switch) {
                Some(row) => row.row.acls.extend(acls),
                None => return Err(BackendError::Missing(format!("logical switch {switch}"))),
            },

            Op::DeletePortGroup { name } => {
                self.port_groups.remove(&name);
            }
        }
        Ok(())
    }

    /// Every ACL referenced by a port group or switch must exist.
    fn validate(&self) -> Result<(), BackendError> {
        let references = self
            .port_groups
            .values()
            .map(|pg| ("port group", &pg.row.name, &pg.row.acls))
            .chain(
                self.switches
                    .values()
                    .map(|ls| ("logical switch", &ls.row.name, &ls.row.acls)),
            );
        for (kind, name, acls) in references {
            for key in acls {
                if !self.acls.values().any(|a| a.key() == Some(key.as_str())) {
                    return Err(BackendError::Constraint(format!(
                        "{kind} {name} references missing ACL {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}
