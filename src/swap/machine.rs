//! The generic engine interpreting a role's transition table.

use crate::{
    messages::Chain,
    swap::{
        action::Action,
        data::{SwapRole, SwapType},
        services::SwapServices,
        Event, State, SwapData,
    },
    SwapId,
};
use anyhow::{Context, Result};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// A valid event for a state moves the machine to `next` and runs `action`.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub next: State,
    pub action: Action,
}

pub(crate) fn transition(
    state: State,
    event: Event,
    next: State,
    action: Action,
) -> ((State, Event), Transition) {
    ((state, event), Transition { next, action })
}

#[derive(Debug)]
pub struct Transitions {
    map: HashMap<(State, Event), Transition>,
    entry_actions: HashMap<State, Action>,
}

impl Transitions {
    pub fn new(rows: Vec<((State, Event), Transition)>) -> Self {
        let mut map = HashMap::new();
        let mut entry_actions = HashMap::new();

        for ((state, event), transition) in rows {
            entry_actions
                .entry(transition.next)
                .or_insert(transition.action);
            map.insert((state, event), transition);
        }

        // A machine that crashed while cancelling recovers by sending a plain
        // cancel, whatever first routed it there.
        entry_actions.insert(State::SendCancel, Action::SendCancel);

        Transitions { map, entry_actions }
    }

    fn get(&self, state: State, event: Event) -> Option<Transition> {
        self.map.get(&(state, event)).copied()
    }

    pub fn contains(&self, state: State, event: Event) -> bool {
        self.map.contains_key(&(state, event))
    }

    fn entry_action(&self, state: State) -> Option<Action> {
        self.entry_actions.get(&state).copied()
    }
}

/// A valid event that does not apply in the machine's current state. Distinct
/// from failure: the caller treats it as a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("event {event} is not applicable in state {state}")]
pub struct EventRejected {
    pub state: State,
    pub event: Event,
}

/// One swap, driven by its role's transition table.
///
/// All mutable state lives in the data record behind an async mutex; exactly
/// one event at a time makes progress, and the lock is deliberately held
/// across the blocking I/O of actions.
#[derive(Debug)]
pub struct SwapStateMachine {
    pub id: SwapId,
    pub swap_type: SwapType,
    pub role: SwapRole,
    peer_node_id: String,
    scid: Option<String>,
    chain: Option<Chain>,
    services: Arc<SwapServices>,
    transitions: Transitions,
    data: Mutex<SwapData>,
}

impl SwapStateMachine {
    pub(crate) fn new(
        data: SwapData,
        services: Arc<SwapServices>,
        transitions: Transitions,
    ) -> Self {
        SwapStateMachine {
            id: data.id,
            swap_type: data.swap_type,
            role: data.role,
            peer_node_id: data.peer_node_id.clone(),
            scid: data.scid(),
            chain: data.chain().ok(),
            services,
            transitions,
            data: Mutex::new(data),
        }
    }

    /// Fixed at creation; every inbound message for this swap must come from
    /// this peer.
    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    pub fn scid(&self) -> Option<&str> {
        self.scid.as_deref()
    }

    pub fn chain(&self) -> Option<Chain> {
        self.chain
    }

    /// A snapshot of the current record.
    pub async fn data(&self) -> SwapData {
        self.data.lock().await.clone()
    }

    /// Applies `event`, running actions and follow-up events until the swap
    /// goes quiet. Returns whether a terminal state was reached.
    pub async fn send_event(&self, event: Event) -> Result<bool> {
        self.send_event_with(event, |_| {}).await
    }

    /// Like [`send_event`], but first lets `prepare` write the event's
    /// context into the record. `prepare` only runs once the event is known
    /// to apply, so a rejected event leaves the record untouched.
    ///
    /// [`send_event`]: SwapStateMachine::send_event
    pub async fn send_event_with<F>(&self, event: Event, prepare: F) -> Result<bool>
    where
        F: FnOnce(&mut SwapData),
    {
        let mut data = self.data.lock().await;

        if !self.transitions.contains(data.current_state, event) {
            return Err(anyhow::Error::new(EventRejected {
                state: data.current_state,
                event,
            }));
        }

        prepare(&mut data);
        self.advance(&mut data, event).await
    }

    /// Replays the entry action of the persisted state, then continues the
    /// machine as usual. Actions are written to be idempotent, so re-running
    /// the one that was in flight when we went down is safe.
    pub async fn recover(&self) -> Result<bool> {
        let mut data = self.data.lock().await;

        let state = data.current_state;
        if state.is_terminal() {
            return Ok(true);
        }
        let action = match self.transitions.entry_action(state) {
            Some(action) => action,
            None => return Ok(false),
        };

        tracing::info!("swap {}: recovering in state {}", self.id, state);
        let event = self.run_action(action, &mut data).await?;

        self.advance(&mut data, event).await
    }

    /// Executes the staged message send outside the normal event flow; used
    /// as a manual retry after a transport failure.
    pub async fn resend_last_message(&self) -> Result<()> {
        let mut data = self.data.lock().await;

        let event = self.run_action(Action::SendMessage, &mut data).await?;
        if event == Event::ActionFailed {
            let last_err = data.last_err.clone().unwrap_or_default();
            return Err(anyhow::anyhow!(last_err).context("failed to resend last message"));
        }

        Ok(())
    }

    async fn advance(&self, data: &mut SwapData, first: Event) -> Result<bool> {
        let mut event = first;

        loop {
            if event == Event::NoOp {
                break;
            }

            let transition = match self.transitions.get(data.current_state, event) {
                Some(transition) => transition,
                None if event == Event::ActionFailed => {
                    // Stay put; the error is on the record and the message can
                    // be resent.
                    tracing::debug!(
                        "swap {}: holding in {} after failed action",
                        self.id,
                        data.current_state
                    );
                    return Ok(false);
                }
                None => {
                    return Err(anyhow::Error::new(EventRejected {
                        state: data.current_state,
                        event,
                    }));
                }
            };

            // Whatever window we were waiting out, this transition closes it.
            self.services.timeout.disarm(&self.id);

            tracing::debug!(
                "swap {}: {} --{}--> {}",
                self.id,
                data.current_state,
                event,
                transition.next
            );
            data.current_state = transition.next;
            self.persist(data).await?;

            if data.current_state.is_terminal() {
                return Ok(true);
            }

            event = self.run_action(transition.action, data).await?;
        }

        Ok(data.current_state.is_terminal())
    }

    /// Runs `action` and persists the record before anything else happens, so
    /// a crash never forgets work the action already did: the mutations are
    /// durable in the state they were made in, not one hop later.
    async fn run_action(&self, action: Action, data: &mut SwapData) -> Result<Event> {
        let event = action.execute(&self.services, data).await;
        self.persist(data).await?;

        Ok(event)
    }

    async fn persist(&self, data: &SwapData) -> Result<()> {
        self.services
            .store
            .update_data(data)
            .await
            .context("failed to persist swap")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::SwapOutRequest,
        swap::{fakes, out_sender},
        PROTOCOL_VERSION, SwapId,
    };

    fn created_machine(world: &fakes::TestWorld) -> SwapStateMachine {
        let id = SwapId::random();
        let mut data = SwapData::new(id, SwapType::SwapOut, "alice", "bob");
        let request = SwapOutRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            asset: String::new(),
            network: "mainnet".to_string(),
            scid: "600000x1x0".to_string(),
            amount: 100_000,
            pubkey: data.pubkey_hex(),
        };
        data.stage_message(&request).unwrap();

        out_sender::from_data(data.with_swap_out_request(request), world.services.clone())
    }

    #[tokio::test]
    async fn rejected_events_leave_the_record_untouched() {
        let world = fakes::test_world();
        let machine = created_machine(&world);

        let result = machine
            .send_event_with(Event::TxConfirmed, |data| {
                data.opening_tx_hex = Some("ff".to_string())
            })
            .await;

        let rejection = result.unwrap_err();
        let rejection = rejection.downcast_ref::<EventRejected>().unwrap();
        assert_eq!(rejection.state, State::Created);
        assert_eq!(rejection.event, Event::TxConfirmed);

        let data = machine.data().await;
        assert_eq!(data.current_state, State::Created);
        assert!(data.opening_tx_hex.is_none());
        // Nothing was persisted either.
        assert!(world.store.swaps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_transition_persists_a_snapshot() {
        let world = fakes::test_world();
        let machine = created_machine(&world);

        machine.send_event(Event::SwapOutStarted).await.unwrap();

        let stored = world
            .store
            .swaps
            .lock()
            .unwrap()
            .get(&machine.id.to_string())
            .cloned()
            .unwrap();
        assert_eq!(stored.current_state, State::AwaitingAgreement);
    }

    #[tokio::test]
    async fn recover_on_a_terminal_swap_is_done_immediately() {
        let world = fakes::test_world();
        let machine = created_machine(&world);
        machine.send_event(Event::SwapOutStarted).await.unwrap();
        machine.send_event(Event::CancelReceived).await.unwrap();

        assert!(machine.recover().await.unwrap());
    }
}
