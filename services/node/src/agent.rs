//! Agent instances, their inboxes, and relocation hooks.
//!
//! An [`AgentInstance`] is the in-memory form of one agent on one container:
//! identity, life-cycle state, private state fields, and the code modules it
//! needs. The instance carries a buffered pre-transaction image while a
//! relocation is in flight, so an abort restores the exact state observed
//! before the transaction started.
//!
//! The inbox is shared separately from the instance so message delivery does
//! not contend with the exclusive hold a relocation takes on the instance.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use caravan_id::AgentName;
use caravan_wire::{
    AgentMessage, AgentSnapshot, LifeCycleState, MobilityError, RelocateMode, SNAPSHOT_VERSION,
};

/// The agent's private state fields.
pub type AgentState = BTreeMap<String, serde_json::Value>;

/// Relocation hooks.
///
/// The pre-hooks run exactly once, after the agent enters TRANSIT or COPY and
/// before the first coordination step; returning an error aborts the
/// transaction before anything left the container. The post-hooks run when
/// the transaction resolves: on the destination at power-up, on the source
/// when it departs or rolls back to ACTIVE.
pub trait Movable: Send {
    fn before_move(&mut self, _state: &mut AgentState) -> Result<(), MobilityError> {
        Ok(())
    }

    fn after_move(&mut self, _state: &mut AgentState) {}

    fn before_clone(&mut self, _state: &mut AgentState) -> Result<(), MobilityError> {
        Ok(())
    }

    fn after_clone(&mut self, _state: &mut AgentState) {}
}

/// Default hook set: every hook is a no-op.
pub struct NoHooks;

impl Movable for NoHooks {}

// =============================================================================
// Inbox
// =============================================================================

/// An agent's message queue.
///
/// Visibility gates delivery: a provisioned copy stays invisible until its
/// transfer verdict arrives, so nothing can reach it while its fate is
/// undecided. A source agent stays visible for the whole transaction; what
/// arrives mid-flight is drained into the transfer buffer at commit time.
pub struct Inbox {
    visible: AtomicBool,
    queue: Mutex<VecDeque<AgentMessage>>,
}

impl Inbox {
    pub fn new(visible: bool) -> Arc<Self> {
        Arc::new(Self {
            visible: AtomicBool::new(visible),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Enqueues a message if the agent is visible to routing. Returns false
    /// (message refused) otherwise.
    pub fn deliver(&self, message: AgentMessage) -> bool {
        if !self.visible.load(Ordering::Acquire) {
            return false;
        }
        self.lock_queue().push_back(message);
        true
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Removes and returns every queued message, oldest first.
    pub fn drain(&self) -> Vec<AgentMessage> {
        self.lock_queue().drain(..).collect()
    }

    /// Re-queues a message at the front of the queue.
    pub fn put_back(&self, message: AgentMessage) {
        self.lock_queue().push_front(message);
    }

    /// Clones the queue contents, oldest first.
    pub fn peek_all(&self) -> Vec<AgentMessage> {
        self.lock_queue().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<AgentMessage>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// AgentInstance
// =============================================================================

/// Pre-transaction image, restored on rollback.
struct Buffered {
    state: LifeCycleState,
    fields: AgentState,
}

/// One agent hosted on this container.
pub struct AgentInstance {
    name: AgentName,
    state: LifeCycleState,
    owner: Option<String>,
    fields: AgentState,
    code_modules: Vec<String>,
    inbox: Arc<Inbox>,
    hooks: Box<dyn Movable>,
    buffered: Option<Buffered>,
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("fields", &self.fields)
            .field("code_modules", &self.code_modules)
            .finish_non_exhaustive()
    }
}

impl AgentInstance {
    /// Creates a fresh ACTIVE agent with a visible inbox.
    pub fn new(name: AgentName, owner: Option<String>) -> Self {
        Self {
            name,
            state: LifeCycleState::Active,
            owner,
            fields: AgentState::new(),
            code_modules: Vec::new(),
            inbox: Inbox::new(true),
            hooks: Box::new(NoHooks),
            buffered: None,
        }
    }

    pub fn with_fields(mut self, fields: AgentState) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_code_modules(mut self, modules: Vec<String>) -> Self {
        self.code_modules = modules;
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn Movable>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Reconstructs an instance from a decoded snapshot, under the identity
    /// the create command carries. The inbox starts invisible; power-up makes
    /// it visible.
    pub fn materialize(
        snapshot: AgentSnapshot,
        name: AgentName,
        mode: RelocateMode,
    ) -> Result<Self, MobilityError> {
        let expected = match mode {
            RelocateMode::Move => LifeCycleState::Transit,
            RelocateMode::Clone => LifeCycleState::Copy,
        };
        if snapshot.lifecycle != expected {
            return Err(MobilityError::Serialization {
                detail: format!(
                    "snapshot life-cycle marker {} does not match {} provisioning",
                    snapshot.lifecycle, mode
                ),
            });
        }
        Ok(Self {
            name,
            state: snapshot.lifecycle,
            owner: snapshot.owner,
            fields: snapshot.state,
            code_modules: snapshot.code_modules,
            inbox: Inbox::new(false),
            hooks: Box::new(NoHooks),
            buffered: None,
        })
    }

    pub fn name(&self) -> &AgentName {
        &self.name
    }

    pub fn state(&self) -> LifeCycleState {
        self.state
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.inbox)
    }

    pub fn fields(&self) -> &AgentState {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut AgentState {
        &mut self.fields
    }

    pub fn code_modules(&self) -> &[String] {
        &self.code_modules
    }

    /// Serializes the private state and pending life-cycle marker.
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            version: SNAPSHOT_VERSION,
            agent: self.name.clone(),
            lifecycle: self.state,
            owner: self.owner.clone(),
            state: self.fields.clone(),
            code_modules: self.code_modules.clone(),
        }
    }

    /// Enters TRANSIT (move) or COPY (clone): buffers the pre-transaction
    /// image, flips state, then runs the pre-hook. A failing pre-hook
    /// restores the image and surfaces its error, leaving the agent ACTIVE.
    pub fn begin_relocation(&mut self, mode: RelocateMode) -> Result<(), MobilityError> {
        let target = match mode {
            RelocateMode::Move => LifeCycleState::Transit,
            RelocateMode::Clone => LifeCycleState::Copy,
        };
        self.check_transition(target)?;

        self.buffered = Some(Buffered {
            state: self.state,
            fields: self.fields.clone(),
        });
        self.state = target;

        let hook_result = match mode {
            RelocateMode::Move => self.hooks.before_move(&mut self.fields),
            RelocateMode::Clone => self.hooks.before_clone(&mut self.fields),
        };
        if let Err(e) = hook_result {
            self.restore_buffered();
            return Err(e);
        }
        Ok(())
    }

    /// Restores the buffered image and returns the agent to ACTIVE, firing
    /// the matching post-hook. Used both for aborts and for the source side
    /// of a committed clone. No-op if no transaction is in flight.
    pub fn resume_active(&mut self) {
        let was = self.state;
        if self.restore_buffered() {
            match was {
                LifeCycleState::Transit => self.hooks.after_move(&mut self.fields),
                LifeCycleState::Copy => self.hooks.after_clone(&mut self.fields),
                _ => {}
            }
        }
    }

    /// Marks the source instance GONE after a committed move and fires the
    /// post-hook. The buffered image is discarded.
    pub fn commit_departure(&mut self) -> Result<(), MobilityError> {
        self.check_transition(LifeCycleState::Gone)?;
        self.state = LifeCycleState::Gone;
        self.buffered = None;
        self.inbox.set_visible(false);
        self.hooks.after_move(&mut self.fields);
        Ok(())
    }

    /// Activates a provisioned instance on the destination: flips to ACTIVE,
    /// fires the post-hook, and opens the inbox to routing.
    pub fn power_up(&mut self) -> Result<(), MobilityError> {
        let was = self.state;
        self.check_transition(LifeCycleState::Active)?;
        self.state = LifeCycleState::Active;
        match was {
            LifeCycleState::Transit => self.hooks.after_move(&mut self.fields),
            LifeCycleState::Copy => self.hooks.after_clone(&mut self.fields),
            _ => {}
        }
        self.inbox.set_visible(true);
        Ok(())
    }

    fn restore_buffered(&mut self) -> bool {
        match self.buffered.take() {
            Some(buffered) => {
                self.state = buffered.state;
                self.fields = buffered.fields;
                true
            }
            None => false,
        }
    }

    fn check_transition(&self, to: LifeCycleState) -> Result<(), MobilityError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(MobilityError::IllegalTransition {
                agent: self.name.clone(),
                from: self.state,
                to,
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
