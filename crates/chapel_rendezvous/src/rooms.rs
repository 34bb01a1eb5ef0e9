/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Room table. Pure bookkeeping: every operation returns the frames to
//! deliver and the caller does the socket I/O.

use chapel_protocol::{ClientMessage, ParticipantId, RoomId, ServerMessage};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

pub type ConnId = u64;

pub type Outbox = Vec<(ConnId, ServerMessage)>;

struct Member {
    user: ParticipantId,
    conn: Option<ConnId>,
    creator: bool,
    // Bumped on every detach so a stale grace timer cannot evict a member
    // that came back in the meantime.
    generation: u64,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
    // Frames that could not be delivered yet, with their sender.
    pending: VecDeque<(ParticipantId, ServerMessage)>,
}

impl Room {
    fn member_by_conn(&self, conn: ConnId) -> Option<&Member> {
        self.members.iter().find(|m| m.conn == Some(conn))
    }

    fn other(&self, user: ParticipantId) -> Option<&Member> {
        self.members.iter().find(|m| m.user != user)
    }

    fn drain_pending_for(&mut self, user: ParticipantId, conn: ConnId, out: &mut Outbox) {
        let mut keep = VecDeque::with_capacity(self.pending.len());
        for (from, msg) in self.pending.drain(..) {
            if from != user {
                out.push((conn, msg));
            } else {
                keep.push_back((from, msg));
            }
        }
        self.pending = keep;
    }

    /// Frees one pending slot, oldest candidate first. Offers and answers
    /// only ever make way for another description.
    fn make_room_for(&mut self, incoming: &ServerMessage) -> bool {
        let victim = match self.pending.iter().position(|(_, m)| is_candidate(m)) {
            Some(idx) => idx,
            None if is_candidate(incoming) => return false,
            None => 0,
        };
        debug!("pending queue full, evicting a buffered frame");
        self.pending.remove(victim);
        true
    }
}

fn is_candidate(msg: &ServerMessage) -> bool {
    matches!(msg, ServerMessage::IceCandidate { .. })
}

/// A member left without saying goodbye; evict it with [`Rooms::expire`]
/// once the grace period elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub room_id: RoomId,
    pub user: ParticipantId,
    pub generation: u64,
}

pub struct Rooms {
    rooms: HashMap<RoomId, Room>,
    max_pending: usize,
}

impl Rooms {
    pub fn new(max_pending: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn handle(&mut self, conn: ConnId, msg: ClientMessage) -> Outbox {
        match msg {
            ClientMessage::JoinRoom { room_id, user_id } => self.join(conn, room_id, user_id),
            ClientMessage::LeaveRoom { room_id, user_id } => self.leave(conn, &room_id, user_id),
            ClientMessage::Offer { room_id, sdp } => {
                let fwd = ServerMessage::Offer {
                    room_id: room_id.clone(),
                    sdp,
                };
                self.relay(conn, &room_id, fwd)
            }
            ClientMessage::Answer { room_id, sdp } => {
                let fwd = ServerMessage::Answer {
                    room_id: room_id.clone(),
                    sdp,
                };
                self.relay(conn, &room_id, fwd)
            }
            ClientMessage::IceCandidate { room_id, candidate } => {
                let fwd = ServerMessage::IceCandidate {
                    room_id: room_id.clone(),
                    candidate,
                };
                self.relay(conn, &room_id, fwd)
            }
        }
    }

    fn join(&mut self, conn: ConnId, room_id: RoomId, user: ParticipantId) -> Outbox {
        let mut out = Vec::new();
        let room = self.rooms.entry(room_id.clone()).or_default();

        if let Some(member) = room.members.iter_mut().find(|m| m.user == user) {
            if member.conn.is_some_and(|c| c != conn) {
                warn!(room=%room_id, %user, "join refused: participant already connected");
                out.push((
                    conn,
                    ServerMessage::Error {
                        message: format!("participant {user} is already in room {room_id}"),
                    },
                ));
                return out;
            }
            // Rejoin after a reconnect: same role as before.
            member.conn = Some(conn);
            let ack = if member.creator {
                ServerMessage::RoomCreated {
                    room_id: room_id.clone(),
                }
            } else {
                ServerMessage::RoomJoined {
                    room_id: room_id.clone(),
                }
            };
            info!(room=%room_id, %user, "participant rejoined");
            out.push((conn, ack));
            room.drain_pending_for(user, conn, &mut out);
            return out;
        }

        match room.members.len() {
            0 => {
                room.members.push(Member {
                    user,
                    conn: Some(conn),
                    creator: true,
                    generation: 0,
                });
                info!(room=%room_id, %user, "room created");
                out.push((conn, ServerMessage::RoomCreated { room_id }));
            }
            1 => {
                room.members.push(Member {
                    user,
                    conn: Some(conn),
                    creator: false,
                    generation: 0,
                });
                info!(room=%room_id, %user, "room joined");
                out.push((
                    conn,
                    ServerMessage::RoomJoined {
                        room_id: room_id.clone(),
                    },
                ));
                room.drain_pending_for(user, conn, &mut out);
            }
            _ => {
                warn!(room=%room_id, %user, "join refused: room full");
                out.push((conn, ServerMessage::RoomFull { room_id }));
            }
        }
        out
    }

    fn relay(&mut self, conn: ConnId, room_id: &RoomId, msg: ServerMessage) -> Outbox {
        let max_pending = self.max_pending;
        let Some(room) = self.rooms.get_mut(room_id) else {
            return vec![(conn, not_in_room(room_id))];
        };
        let Some(sender) = room.member_by_conn(conn).map(|m| m.user) else {
            return vec![(conn, not_in_room(room_id))];
        };
        match room.other(sender).and_then(|m| m.conn) {
            Some(to) => vec![(to, msg)],
            None => {
                if room.pending.len() >= max_pending && !room.make_room_for(&msg) {
                    warn!(room=%room_id, "pending queue full, candidate dropped");
                    return Vec::new();
                }
                debug!(room=%room_id, "peer absent, buffering frame");
                room.pending.push_back((sender, msg));
                Vec::new()
            }
        }
    }

    fn leave(&mut self, conn: ConnId, room_id: &RoomId, user: ParticipantId) -> Outbox {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        if room.member_by_conn(conn).map(|m| m.user) != Some(user) {
            warn!(room=%room_id, %user, "leave ignored: not a member on this connection");
            return Vec::new();
        }
        self.remove_member(room_id, user)
    }

    fn remove_member(&mut self, room_id: &RoomId, user: ParticipantId) -> Outbox {
        let mut out = Vec::new();
        let Some(room) = self.rooms.get_mut(room_id) else {
            return out;
        };
        room.members.retain(|m| m.user != user);
        room.pending.retain(|(from, _)| *from != user);
        info!(room=%room_id, %user, "participant left");
        if let Some(to) = room.members.first().and_then(|m| m.conn) {
            out.push((
                to,
                ServerMessage::UserDisconnected {
                    room_id: room_id.clone(),
                },
            ));
        }
        if room.members.is_empty() {
            self.rooms.remove(room_id);
        }
        out
    }

    /// Connection dropped: detach its memberships.
    pub fn detach(&mut self, conn: ConnId) -> Vec<Detached> {
        let mut detached = Vec::new();
        for (room_id, room) in self.rooms.iter_mut() {
            for m in room.members.iter_mut().filter(|m| m.conn == Some(conn)) {
                m.conn = None;
                m.generation += 1;
                detached.push(Detached {
                    room_id: room_id.clone(),
                    user: m.user,
                    generation: m.generation,
                });
            }
        }
        detached
    }

    pub fn expire(&mut self, d: &Detached) -> Outbox {
        let still_gone = self
            .rooms
            .get(&d.room_id)
            .and_then(|r| r.members.iter().find(|m| m.user == d.user))
            .map(|m| m.conn.is_none() && m.generation == d.generation)
            .unwrap_or(false);
        if !still_gone {
            return Vec::new();
        }
        self.remove_member(&d.room_id, d.user)
    }
}

fn not_in_room(room_id: &RoomId) -> ServerMessage {
    ServerMessage::Error {
        message: format!("not a member of room {room_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapel_protocol::{IceCandidate, SessionDescription};

    fn room() -> RoomId {
        RoomId::new("room-42")
    }

    fn join(user: u64) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room(),
            user_id: ParticipantId(user),
        }
    }

    fn candidate() -> ClientMessage {
        ClientMessage::IceCandidate {
            room_id: room(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        }
    }

    #[test]
    fn first_joiner_creates_second_joins() {
        let mut rooms = Rooms::new(8);
        let a = rooms.handle(1, join(1));
        let b = rooms.handle(2, join(2));
        assert_eq!(a, vec![(1, ServerMessage::RoomCreated { room_id: room() })]);
        assert_eq!(b, vec![(2, ServerMessage::RoomJoined { room_id: room() })]);
    }

    #[test]
    fn third_joiner_is_refused() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        rooms.handle(2, join(2));
        let c = rooms.handle(3, join(3));
        assert_eq!(c, vec![(3, ServerMessage::RoomFull { room_id: room() })]);
    }

    #[test]
    fn offer_sent_while_alone_is_flushed_after_room_joined() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        let sent = rooms.handle(
            1,
            ClientMessage::Offer {
                room_id: room(),
                sdp: SessionDescription::offer("v=0"),
            },
        );
        assert!(sent.is_empty());
        rooms.handle(1, candidate());

        let b = rooms.handle(2, join(2));
        assert_eq!(b.len(), 3);
        assert_eq!(b[0], (2, ServerMessage::RoomJoined { room_id: room() }));
        assert!(matches!(b[1], (2, ServerMessage::Offer { .. })));
        assert!(matches!(b[2], (2, ServerMessage::IceCandidate { .. })));
    }

    #[test]
    fn pending_queue_is_bounded() {
        let mut rooms = Rooms::new(2);
        rooms.handle(1, join(1));
        for _ in 0..5 {
            rooms.handle(1, candidate());
        }
        let b = rooms.handle(2, join(2));
        // room-joined + the two newest candidates
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn buffered_offer_survives_candidate_overflow() {
        let mut rooms = Rooms::new(3);
        rooms.handle(1, join(1));
        rooms.handle(
            1,
            ClientMessage::Offer {
                room_id: room(),
                sdp: SessionDescription::offer("v=0"),
            },
        );
        for _ in 0..10 {
            rooms.handle(1, candidate());
        }
        let b = rooms.handle(2, join(2));
        assert_eq!(b.len(), 4);
        assert_eq!(b[0], (2, ServerMessage::RoomJoined { room_id: room() }));
        assert!(matches!(b[1], (2, ServerMessage::Offer { .. })));
        assert!(b[2..]
            .iter()
            .all(|(to, m)| *to == 2 && matches!(m, ServerMessage::IceCandidate { .. })));
    }

    #[test]
    fn candidate_is_dropped_when_only_descriptions_are_pending() {
        let mut rooms = Rooms::new(1);
        rooms.handle(1, join(1));
        rooms.handle(
            1,
            ClientMessage::Offer {
                room_id: room(),
                sdp: SessionDescription::offer("v=0"),
            },
        );
        assert!(rooms.handle(1, candidate()).is_empty());
        let b = rooms.handle(2, join(2));
        assert_eq!(b.len(), 2);
        assert!(matches!(b[1], (2, ServerMessage::Offer { .. })));
    }

    #[test]
    fn same_participant_on_a_live_connection_is_refused() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        let dup = rooms.handle(5, join(1));
        assert!(matches!(dup.as_slice(), [(5, ServerMessage::Error { .. })]));

        // The original connection keeps the membership and its role.
        let again = rooms.handle(1, join(1));
        assert_eq!(again, vec![(1, ServerMessage::RoomCreated { room_id: room() })]);
        let b = rooms.handle(2, join(2));
        assert_eq!(b, vec![(2, ServerMessage::RoomJoined { room_id: room() })]);
        let out = rooms.handle(5, candidate());
        assert!(matches!(out.as_slice(), [(5, ServerMessage::Error { .. })]));
    }

    #[test]
    fn leave_notifies_other_member_and_drops_empty_room() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        rooms.handle(2, join(2));
        let out = rooms.handle(
            2,
            ClientMessage::LeaveRoom {
                room_id: room(),
                user_id: ParticipantId(2),
            },
        );
        assert_eq!(out, vec![(1, ServerMessage::UserDisconnected { room_id: room() })]);
        rooms.handle(
            1,
            ClientMessage::LeaveRoom {
                room_id: room(),
                user_id: ParticipantId(1),
            },
        );
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn rejoin_after_reconnect_keeps_role_and_cancels_expiry() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        rooms.handle(2, join(2));
        let detached = rooms.detach(1);
        assert_eq!(detached.len(), 1);

        // The responder's answer waits for the initiator to come back.
        let out = rooms.handle(
            2,
            ClientMessage::Answer {
                room_id: room(),
                sdp: SessionDescription::answer("v=0"),
            },
        );
        assert!(out.is_empty());

        let back = rooms.handle(7, join(1));
        assert_eq!(back[0], (7, ServerMessage::RoomCreated { room_id: room() }));
        assert!(matches!(back[1], (7, ServerMessage::Answer { .. })));

        assert!(rooms.expire(&detached[0]).is_empty());
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn expiry_evicts_member_that_never_returned() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        rooms.handle(2, join(2));
        let detached = rooms.detach(2);
        let out = rooms.expire(&detached[0]);
        assert_eq!(out, vec![(1, ServerMessage::UserDisconnected { room_id: room() })]);
    }

    #[test]
    fn relay_from_non_member_is_rejected() {
        let mut rooms = Rooms::new(8);
        rooms.handle(1, join(1));
        let out = rooms.handle(9, candidate());
        assert!(matches!(out.as_slice(), [(9, ServerMessage::Error { .. })]));
    }
}
