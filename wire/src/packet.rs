use std::fmt;

use crate::vars::{SlotRef, VarDecls, VarError, VarStore};

/// Largest packet payload a template can carry.
pub const MAX_PAYLOAD: usize = 1024;
/// Slot references one packet may overlay before each send.
pub const MAX_PACKET_VARS: usize = 8;
/// Post-substitution mutations one packet may carry.
pub const MAX_PACKET_ACTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Increment,
}

impl Operator {
    /// Configuration spelling of each operator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inc" => Some(Self::Increment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub op: Operator,
    pub target: SlotRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    PayloadTooLarge(usize),
    TooManyVars,
    TooManyActions,
    GlobalMutation(SlotRef),
    PayloadOverrun { off: usize, size: usize, len: usize },
    Var(VarError),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge(len) => {
                write!(f, "packet payload of {len} bytes exceeds {MAX_PAYLOAD}")
            }
            Self::TooManyVars => write!(f, "too many variables specified in packet"),
            Self::TooManyActions => write!(f, "too many actions specified in packet"),
            Self::GlobalMutation(slot) => write!(f, "cannot modify globals ({slot})"),
            Self::PayloadOverrun { off, size, len } => write!(
                f,
                "variable overlay [{off}, {}) overruns the {len} byte payload",
                off + size
            ),
            Self::Var(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for PacketError {}

impl From<VarError> for PacketError {
    fn from(err: VarError) -> Self {
        Self::Var(err)
    }
}

/// One packet of a flow: a fixed-capacity payload plus the slot overlays and
/// mutations applied on every send.
///
/// Everything is inline fixed-size storage. Templates are rewritten in place
/// on the emit path and must not touch the allocator there.
#[derive(Clone, Copy)]
pub struct Packet {
    payload: [u8; MAX_PAYLOAD],
    payload_len: usize,
    pub answer_tag: u64,
    vars: [SlotRef; MAX_PACKET_VARS],
    var_count: usize,
    actions: [Action; MAX_PACKET_ACTIONS],
    action_count: usize,
}

impl Packet {
    pub fn from_payload(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(bytes.len()));
        }
        let mut payload = [0u8; MAX_PAYLOAD];
        payload[..bytes.len()].copy_from_slice(bytes);
        const NO_SLOT: SlotRef = match SlotRef::new(0) {
            Some(slot) => slot,
            None => unreachable!(),
        };
        Ok(Self {
            payload,
            payload_len: bytes.len(),
            answer_tag: 0,
            vars: [NO_SLOT; MAX_PACKET_VARS],
            var_count: 0,
            actions: [Action { op: Operator::Increment, target: NO_SLOT }; MAX_PACKET_ACTIONS],
            action_count: 0,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    pub fn push_var(&mut self, slot: SlotRef) -> Result<(), PacketError> {
        if self.var_count == MAX_PACKET_VARS {
            return Err(PacketError::TooManyVars);
        }
        self.vars[self.var_count] = slot;
        self.var_count += 1;
        Ok(())
    }

    pub fn push_action(&mut self, action: Action) -> Result<(), PacketError> {
        if self.action_count == MAX_PACKET_ACTIONS {
            return Err(PacketError::TooManyActions);
        }
        self.actions[self.action_count] = action;
        self.action_count += 1;
        Ok(())
    }

    /// Rewrites the payload from the variable stores, then runs the packet's
    /// actions against the local store.
    ///
    /// Substitution copies `decls.size(slot)` bytes from the referenced
    /// scope's cell to `decls.off(slot)`. Actions may only target local
    /// slots; the global store is read-only once the threads are running.
    pub fn apply_variables(
        &mut self,
        decls: &VarDecls,
        global: &VarStore,
        local: &mut VarStore,
    ) -> Result<(), PacketError> {
        for slot in &self.vars[..self.var_count] {
            let size = decls.size(*slot);
            let off = decls.off(*slot);
            if off + size > self.payload_len {
                return Err(PacketError::PayloadOverrun {
                    off,
                    size,
                    len: self.payload_len,
                });
            }
            let cell = if slot.is_global() {
                global.cell(slot.cell())
            } else {
                local.cell(slot.cell())
            };
            self.payload[off..off + size].copy_from_slice(&cell[..size]);
        }

        for action in &self.actions[..self.action_count] {
            if action.target.is_global() {
                return Err(PacketError::GlobalMutation(action.target));
            }
            match action.op {
                Operator::Increment => {
                    local.increment(action.target.cell(), decls.size(action.target))?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("payload_len", &self.payload_len)
            .field("answer_tag", &self.answer_tag)
            .field("vars", &&self.vars[..self.var_count])
            .field("actions", &&self.actions[..self.action_count])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: usize) -> SlotRef {
        SlotRef::new(index).unwrap()
    }

    #[test]
    fn substitutes_from_both_scopes() {
        let mut decls = VarDecls::new();
        decls.declare(slot(0), 4, 8).unwrap(); // global
        decls.declare(slot(8), 2, 16).unwrap(); // local

        let mut global = VarStore::new();
        global.set_uint(0, 4, 0x0000_0001).unwrap();
        let mut local = VarStore::new();
        local.set_uint(0, 2, 0x0100).unwrap();

        let mut packet = Packet::from_payload(&[0u8; 32]).unwrap();
        packet.push_var(slot(0)).unwrap();
        packet.push_var(slot(8)).unwrap();

        packet.apply_variables(&decls, &global, &mut local).unwrap();
        assert_eq!(&packet.payload()[8..12], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&packet.payload()[16..18], &[0x00, 0x01]);
    }

    #[test]
    fn increment_action_advances_across_sends() {
        let mut decls = VarDecls::new();
        decls.declare(slot(0), 4, 8).unwrap();
        decls.declare(slot(8), 2, 16).unwrap();

        let mut global = VarStore::new();
        global.set_uint(0, 4, 1).unwrap();
        let mut local = VarStore::new();
        local.set_uint(0, 2, 0x0100).unwrap();

        let mut packet = Packet::from_payload(&[0u8; 32]).unwrap();
        packet.push_var(slot(0)).unwrap();
        packet.push_var(slot(8)).unwrap();
        packet.push_action(Action { op: Operator::Increment, target: slot(8) }).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            packet.apply_variables(&decls, &global, &mut local).unwrap();
            seen.push(packet.payload()[16..18].to_vec());
        }

        assert_eq!(seen, vec![vec![0x00, 0x01], vec![0x01, 0x01], vec![0x02, 0x01]]);
        assert_eq!(&local.cell(0)[..2], &[0x03, 0x01]);
        assert_eq!(&packet.payload()[8..12], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn rejects_action_on_global_slot() {
        let mut decls = VarDecls::new();
        decls.declare(slot(1), 4, 0).unwrap();

        let global = VarStore::new();
        let mut local = VarStore::new();

        let mut packet = Packet::from_payload(&[0u8; 8]).unwrap();
        packet.push_action(Action { op: Operator::Increment, target: slot(1) }).unwrap();

        assert_eq!(
            packet.apply_variables(&decls, &global, &mut local),
            Err(PacketError::GlobalMutation(slot(1)))
        );
    }

    #[test]
    fn rejects_overlay_past_payload_end() {
        let mut decls = VarDecls::new();
        decls.declare(slot(8), 4, 6).unwrap();

        let global = VarStore::new();
        let mut local = VarStore::new();

        let mut packet = Packet::from_payload(&[0u8; 8]).unwrap();
        packet.push_var(slot(8)).unwrap();

        assert_eq!(
            packet.apply_variables(&decls, &global, &mut local),
            Err(PacketError::PayloadOverrun { off: 6, size: 4, len: 8 })
        );
    }

    #[test]
    fn caps_vars_and_actions() {
        let mut packet = Packet::from_payload(&[]).unwrap();
        for i in 0..MAX_PACKET_VARS {
            packet.push_var(slot(i)).unwrap();
        }
        assert_eq!(packet.push_var(slot(0)), Err(PacketError::TooManyVars));

        for _ in 0..MAX_PACKET_ACTIONS {
            packet
                .push_action(Action { op: Operator::Increment, target: slot(8) })
                .unwrap();
        }
        assert_eq!(
            packet.push_action(Action { op: Operator::Increment, target: slot(8) }),
            Err(PacketError::TooManyActions)
        );
    }

    #[test]
    fn operator_parsing() {
        assert_eq!(Operator::parse("inc"), Some(Operator::Increment));
        assert_eq!(Operator::parse("dec"), None);
    }
}
