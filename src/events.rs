//! Real-time lead notifications.
//!
//! Events are addressed to named rooms and pushed through a
//! `tokio::sync::broadcast` channel. Every socket subscribes to the channel
//! and forwards only the events addressed to a room it has joined. Delivery
//! is best-effort and at-most-once: nothing is queued for disconnected
//! clients and publishing never fails the originating request.

use crate::models::{Lead, Role};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Room every superadmin joins; receives all events.
pub const SUPERADMIN_ROOM: &str = "superadmin";

/// Room of a single user.
pub fn user_room(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

/// Room of all users holding `role` inside an organization.
pub fn org_role_room(organization_id: Uuid, role: Role) -> String {
    format!("org:{}:{}", organization_id, role.as_str())
}

/// Rooms a user is entitled to. Joined at connect time; `join-room`
/// requests outside this set are refused.
pub fn rooms_for(user_id: Uuid, role: Role, organization_id: Option<Uuid>) -> HashSet<String> {
    let mut rooms = HashSet::new();
    rooms.insert(user_room(user_id));
    match (role, organization_id) {
        (Role::Superadmin, _) => {
            rooms.insert(SUPERADMIN_ROOM.to_string());
        }
        (role, Some(org)) => {
            rooms.insert(org_role_room(org, role));
        }
        (_, None) => {}
    }
    rooms
}

/// Payload of lead events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadEventData {
    pub id: Uuid,
    pub lead_id: String,
    pub organization: Uuid,
    /// Display name of the user who caused the event.
    pub actor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead: Option<Lead>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEventData {
    pub organization: Uuid,
}

/// Wire events, serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LeadEvent {
    #[serde(rename = "leadCreated")]
    LeadCreated(LeadEventData),
    #[serde(rename = "leadUpdated")]
    LeadUpdated(LeadEventData),
    #[serde(rename = "leadDeleted")]
    LeadDeleted(LeadEventData),
    #[serde(rename = "statsUpdated")]
    StatsUpdated(StatsEventData),
}

impl LeadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LeadEvent::LeadCreated(_) => "leadCreated",
            LeadEvent::LeadUpdated(_) => "leadUpdated",
            LeadEvent::LeadDeleted(_) => "leadDeleted",
            LeadEvent::StatsUpdated(_) => "statsUpdated",
        }
    }
}

/// An event plus the rooms it is addressed to. The JSON text is rendered
/// once at publish time and shared by all subscribers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub rooms: Arc<HashSet<String>>,
    pub event_name: &'static str,
    pub json: Arc<str>,
}

impl Envelope {
    pub fn is_for(&self, joined: &HashSet<String>) -> bool {
        !self.rooms.is_disjoint(joined)
    }
}

/// The lead plus whatever users must hear about it beyond admins.
#[derive(Debug, Clone, Copy)]
pub struct Audience {
    pub organization_id: Uuid,
    pub created_by: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    /// Previous assignee on reassignment or unassignment.
    pub previously_assigned_to: Option<Uuid>,
}

impl Audience {
    pub fn of(lead: &Lead) -> Self {
        Self {
            organization_id: lead.organization_id,
            created_by: lead.created_by,
            assigned_to: lead.assigned_to,
            previously_assigned_to: None,
        }
    }

    pub fn with_previous_assignee(mut self, previous: Option<Uuid>) -> Self {
        if previous != self.assigned_to {
            self.previously_assigned_to = previous;
        }
        self
    }

    pub fn rooms(&self) -> HashSet<String> {
        let mut rooms = admin_rooms(self.organization_id);
        for user in [self.created_by, self.assigned_to, self.previously_assigned_to]
            .into_iter()
            .flatten()
        {
            rooms.insert(user_room(user));
        }
        rooms
    }
}

fn admin_rooms(organization_id: Uuid) -> HashSet<String> {
    let mut rooms = HashSet::new();
    rooms.insert(SUPERADMIN_ROOM.to_string());
    rooms.insert(org_role_room(organization_id, Role::Admin));
    rooms
}

/// Fire-and-forget publisher shared through application state.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `event` to `rooms`. Never blocks and never fails; a send with
    /// no connected sockets is simply dropped.
    pub fn publish(&self, rooms: HashSet<String>, event: &LeadEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        let envelope = Envelope {
            rooms: Arc::new(rooms),
            event_name: event.name(),
            json: Arc::from(json),
        };

        match self.tx.send(envelope) {
            Ok(receivers) => {
                tracing::debug!("📣 {} delivered to {} socket(s)", event.name(), receivers)
            }
            Err(_) => tracing::trace!("{} dropped: no sockets connected", event.name()),
        }
    }

    pub fn lead_created(&self, lead: &Lead, actor_name: &str) {
        let data = lead_data(lead, actor_name, true);
        self.publish(Audience::of(lead).rooms(), &LeadEvent::LeadCreated(data));
        self.stats_updated(lead.organization_id);
    }

    pub fn lead_updated(&self, lead: &Lead, actor_name: &str, previous_assignee: Option<Uuid>) {
        let data = lead_data(lead, actor_name, true);
        let audience = Audience::of(lead).with_previous_assignee(previous_assignee);
        self.publish(audience.rooms(), &LeadEvent::LeadUpdated(data));
        self.stats_updated(lead.organization_id);
    }

    pub fn lead_deleted(&self, lead: &Lead, actor_name: &str) {
        let data = lead_data(lead, actor_name, false);
        self.publish(Audience::of(lead).rooms(), &LeadEvent::LeadDeleted(data));
        self.stats_updated(lead.organization_id);
    }

    pub fn stats_updated(&self, organization_id: Uuid) {
        self.publish(
            admin_rooms(organization_id),
            &LeadEvent::StatsUpdated(StatsEventData {
                organization: organization_id,
            }),
        );
    }
}

fn lead_data(lead: &Lead, actor_name: &str, include_lead: bool) -> LeadEventData {
    LeadEventData {
        id: lead.id,
        lead_id: lead.lead_id.clone(),
        organization: lead.organization_id,
        actor_name: actor_name.to_string(),
        lead: include_lead.then(|| lead.clone()),
    }
}
