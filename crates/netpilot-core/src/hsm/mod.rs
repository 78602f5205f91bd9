//! Hierarchical state machine driving the connectivity worker.
//!
//! Every state has a parent; a message a state does not handle bubbles up to
//! the parent and finally to [`StateId::Default`], which handles everything.
//! A state may also hand a message to another state: the machine transitions
//! and redelivers the message there before anything queued behind it.

pub mod default;
pub mod dual;
pub mod fmc;
pub mod message;
pub mod smart;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::Variant;
use crate::connectivity::Connectivity;
use message::{Message, MessageQueue, Queued};

/// Redeliveries after which a message is handed to the root state.
pub const MAX_REDELIVERIES: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateId {
    #[default]
    Default,
    Smart,
    WifiDefault,
    MobileDefault,
    FmcInitial,
    FmcActive,
}

impl StateId {
    pub fn parent(self) -> Option<StateId> {
        match self {
            StateId::Default => None,
            StateId::Smart | StateId::FmcInitial | StateId::FmcActive => Some(StateId::Default),
            StateId::WifiDefault | StateId::MobileDefault => Some(StateId::Smart),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StateId::Default => "default",
            StateId::Smart => "smart",
            StateId::WifiDefault => "wifi_default",
            StateId::MobileDefault => "mobile_default",
            StateId::FmcInitial => "fmc_initial",
            StateId::FmcActive => "fmc_active",
        }
    }

    pub fn initial(variant: Variant) -> StateId {
        match variant {
            Variant::Single => StateId::Default,
            Variant::Smart => StateId::Smart,
            Variant::Fmc => StateId::FmcInitial,
        }
    }

    /// Root first.
    fn path(self) -> Vec<StateId> {
        let mut path = vec![self];
        let mut cur = self;
        while let Some(parent) = cur.parent() {
            path.push(parent);
            cur = parent;
        }
        path.reverse();
        path
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    NotHandled,
    /// Transition to the state and redeliver the message there.
    DeferTo(StateId),
}

fn handle(state: StateId, ctx: &mut Connectivity, msg: &mut Message) -> Disposition {
    match state {
        StateId::Default => default::handle(ctx, msg),
        StateId::Smart => smart::handle(ctx, msg),
        StateId::WifiDefault | StateId::MobileDefault => dual::handle(state, ctx, msg),
        StateId::FmcInitial => fmc::handle_initial(ctx, msg),
        StateId::FmcActive => fmc::handle_active(ctx, msg),
    }
}

fn enter(state: StateId, ctx: &mut Connectivity) {
    debug!(target: "hsm", "enter {}", state);
    match state {
        StateId::WifiDefault | StateId::MobileDefault => dual::enter(state, ctx),
        StateId::FmcInitial => fmc::enter_initial(ctx),
        StateId::FmcActive => fmc::enter_active(ctx),
        StateId::Default | StateId::Smart => {}
    }
}

fn exit(state: StateId, ctx: &mut Connectivity) {
    debug!(target: "hsm", "exit {}", state);
    if let StateId::WifiDefault | StateId::MobileDefault = state {
        dual::exit(ctx);
    }
}

pub struct StateMachine {
    current: StateId,
    queue: MessageQueue,
    clock: Arc<dyn Clock>,
    ctx: Connectivity,
}

impl StateMachine {
    pub fn new(mut ctx: Connectivity, clock: Arc<dyn Clock>) -> Self {
        let current = StateId::initial(ctx.shared.config.variant);
        for state in current.path() {
            enter(state, &mut ctx);
        }
        let mut machine = Self {
            current,
            queue: MessageQueue::new(),
            clock,
            ctx,
        };
        machine.settle();
        machine
    }

    pub fn current(&self) -> StateId {
        self.current
    }

    pub fn ctx(&self) -> &Connectivity {
        &self.ctx
    }

    pub fn post(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    pub fn post_delayed(&mut self, msg: Message, delay: Duration) {
        let due = self.clock.now() + delay;
        self.queue.push_delayed(msg, due);
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.next_due()
    }

    /// Promotes due timers and dispatches until the ready queue is empty.
    /// Returns the number of messages dispatched.
    pub fn process_due(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            self.queue.promote_due(self.clock.now());
            let Some(queued) = self.queue.pop() else {
                break;
            };
            self.dispatch(queued);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&mut self, queued: Queued) {
        let Queued {
            mut msg,
            redeliveries,
        } = queued;
        trace!(target: "hsm", "{} <- {}", self.current, msg.name());

        if redeliveries > MAX_REDELIVERIES {
            warn!(
                target: "hsm",
                "{} bounced {} times, handing it to the default state",
                msg.name(),
                redeliveries
            );
            default::handle(&mut self.ctx, &mut msg);
            self.settle();
            return;
        }

        let mut state = Some(self.current);
        while let Some(s) = state {
            match handle(s, &mut self.ctx, &mut msg) {
                Disposition::Handled => break,
                Disposition::NotHandled => state = s.parent(),
                Disposition::DeferTo(target) if target == self.current => {
                    default::handle(&mut self.ctx, &mut msg);
                    break;
                }
                Disposition::DeferTo(target) => {
                    self.queue.push_front(Queued {
                        msg,
                        redeliveries: redeliveries + 1,
                    });
                    self.transition_to(target);
                    self.settle();
                    return;
                }
            }
        }
        self.settle();
    }

    fn transition_to(&mut self, target: StateId) {
        let from = self.current.path();
        let to = target.path();
        let common = from
            .iter()
            .zip(to.iter())
            .take_while(|(a, b)| a == b)
            .count();
        for state in from[common..].iter().rev() {
            exit(*state, &mut self.ctx);
        }
        for state in &to[common..] {
            enter(*state, &mut self.ctx);
        }
        debug!(target: "hsm", "{} -> {}", self.current, target);
        self.current = target;
    }

    /// Moves messages posted by handlers onto the queue and republishes the
    /// snapshot.
    fn settle(&mut self) {
        let now = self.clock.now();
        for (msg, delay) in self.ctx.take_pending() {
            if delay.is_zero() {
                self.queue.push_back(msg);
            } else {
                self.queue.push_delayed(msg, now + delay);
            }
        }
        self.ctx.publish_snapshot(self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_run_from_the_root() {
        assert_eq!(
            StateId::WifiDefault.path(),
            vec![StateId::Default, StateId::Smart, StateId::WifiDefault]
        );
        assert_eq!(
            StateId::FmcActive.path(),
            vec![StateId::Default, StateId::FmcActive]
        );
        assert_eq!(StateId::Default.path(), vec![StateId::Default]);
    }

    #[test]
    fn initial_state_follows_the_variant() {
        assert_eq!(StateId::initial(Variant::Single), StateId::Default);
        assert_eq!(StateId::initial(Variant::Smart), StateId::Smart);
        assert_eq!(StateId::initial(Variant::Fmc), StateId::FmcInitial);
    }
}
