use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, bail};
use serde::Deserialize;
use wire::{
    Action, Field, FrameConfig, Operator, Packet, SCOPE_SLOTS, SLOT_COUNT, SlotRef, VarDecls,
    VarStore,
};

use crate::{
    cadence::Plan,
    logging::CadenceLogger,
    sender::{Sender, Session},
};

/// Top-level shape of the TOML configuration file.
///
/// Variable maps are `BTreeMap`s on purpose: slot assignment follows the
/// deterministic sorted name order, so the same file always produces the
/// same slot layout.
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    /// Declared variables: name -> where the value lives inside packets.
    pub variables: BTreeMap<String, FieldSpec>,

    /// Initial values of the global scope. Names listed here get global
    /// slots; all other declared variables are session-local.
    #[serde(default)]
    pub global: BTreeMap<String, toml::Value>,

    /// One entry per session: initial values of its local variables.
    #[serde(default)]
    pub sessions: Vec<BTreeMap<String, toml::Value>>,

    pub flow: FlowSpec,
    pub sender: SenderSpec,
    pub receiver: ReceiverSpec,

    #[serde(flatten)]
    pub other_fields: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FieldSpec {
    pub off: u32,
    pub size: u32,
}

impl From<FieldSpec> for Field {
    fn from(spec: FieldSpec) -> Self {
        Field::new(spec.off, spec.size)
    }
}

#[derive(Debug, Deserialize)]
pub struct FlowSpec {
    pub prelude: Vec<PacketSpec>,
    pub main: Vec<PacketSpec>,
}

#[derive(Debug, Deserialize)]
pub struct PacketSpec {
    /// Hex-encoded payload, case-insensitive, even length.
    pub pkt: String,
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub answer_tag: u64,
}

#[derive(Debug, Deserialize)]
pub struct ActionSpec {
    pub op: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SenderSpec {
    /// One sender thread per listed core.
    pub cores: Vec<usize>,
    /// Accepted and stored, reserved for future use.
    #[serde(default)]
    pub priority: u32,
    /// Optional cap on how many configured sessions are consumed.
    #[serde(default)]
    pub sessions: Option<usize>,
    pub session: SessionSpec,
}

#[derive(Debug, Deserialize)]
pub struct SessionSpec {
    pub interval_ns: u64,
    pub start_off_inc_ns: u64,
    #[serde(default)]
    pub start_off_ns: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReceiverSpec {
    pub core: usize,
    pub error_tag: u64,
    pub error_msg_off: u32,
    pub len: FieldSpec,
    pub tag: FieldSpec,
    pub error_msg_len: FieldSpec,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("could not open config")]
    Io(#[from] std::io::Error),
    #[error("could not parse config")]
    Parse(#[from] toml::de::Error),
}

impl LoadConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigLoadError> {
        let config: Self = toml::from_str(raw)?;
        for (key, value) in &config.other_fields {
            CadenceLogger::unknown_config_key(key, value);
        }
        Ok(config)
    }

    /// Lowers the parsed file into the runtime plan.
    ///
    /// `sender_cap` (the `-j` flag) truncates the sender list before the
    /// sessions are distributed, so every configured session still lands on
    /// a live sender.
    pub fn build(&self, sender_cap: Option<usize>) -> anyhow::Result<Plan> {
        let (decls, slots) = self.assign_slots()?;

        let mut globals = VarStore::new();
        for (name, value) in &self.global {
            let slot = *slots
                .get(name)
                .with_context(|| format!("couldn't find variable decl: {name}"))?;
            store_value(&mut globals, slot, &decls, value)
                .with_context(|| format!("global variable {name}"))?;
        }

        if self.sessions.is_empty() {
            bail!("no sessions defined");
        }
        let mut session_stores = Vec::with_capacity(self.sessions.len());
        for (index, assignments) in self.sessions.iter().enumerate() {
            let mut store = VarStore::new();
            for (name, value) in assignments {
                let slot = *slots
                    .get(name)
                    .with_context(|| format!("couldn't find variable decl: {name}"))?;
                if slot.is_global() {
                    bail!("accessing a global variable from a local context: {name}");
                }
                store_value(&mut store, slot, &decls, value)
                    .with_context(|| format!("session {index}, variable {name}"))?;
            }
            session_stores.push(store);
        }

        if self.flow.main.is_empty() {
            bail!("flow.main must contain at least one packet");
        }
        let prelude = build_flow(&self.flow.prelude, &slots).context("flow.prelude")?;
        let main = build_flow(&self.flow.main, &slots).context("flow.main")?;

        if self.sender.cores.is_empty() {
            bail!("no sender.cores specified");
        }
        let cores = match sender_cap {
            Some(cap) if cap < self.sender.cores.len() => &self.sender.cores[..cap],
            _ => &self.sender.cores[..],
        };
        if self.sender.session.interval_ns == 0 {
            bail!("no sender.session.interval_ns specified");
        }
        if self.sender.session.start_off_inc_ns == 0 {
            bail!("no sender.session.start_off_inc_ns specified");
        }

        // Every sender gets its own flow copies: payloads are rewritten in
        // place per session.
        let mut senders: Vec<Sender> = cores
            .iter()
            .map(|&core| Sender::new(core, prelude.clone(), main.clone()))
            .collect();

        let session_limit = self.sender.sessions.unwrap_or(usize::MAX);
        let mut start_off_ns = self.sender.session.start_off_ns;
        for (index, store) in session_stores.iter().enumerate().take(session_limit) {
            let sender_index = index % senders.len();
            senders[sender_index].sessions.push(Session::new(
                start_off_ns,
                self.sender.session.interval_ns,
                *store,
            ));
            start_off_ns += self.sender.session.start_off_inc_ns;
        }
        for sender in &senders {
            if sender.sessions.is_empty() {
                bail!(
                    "sender on core {} has no sessions (more cores than sessions?)",
                    sender.core
                );
            }
        }

        let frame = self.frame_config()?;

        Ok(Plan {
            senders,
            receiver_core: self.receiver.core,
            frame,
            decls,
            globals,
        })
    }

    /// Assigns each declared variable a slot: globals first in sorted name
    /// order, then locals, eight apiece.
    fn assign_slots(&self) -> anyhow::Result<(VarDecls, BTreeMap<String, SlotRef>)> {
        let mut decls = VarDecls::new();
        let mut slots = BTreeMap::new();
        let mut next_global = 0;
        let mut next_local = SCOPE_SLOTS;

        for (name, spec) in &self.variables {
            let index = if self.global.contains_key(name) {
                if next_global == SCOPE_SLOTS {
                    bail!("too many global variables");
                }
                next_global += 1;
                next_global - 1
            } else {
                if next_local == SLOT_COUNT {
                    bail!("too many local variables");
                }
                next_local += 1;
                next_local - 1
            };
            let slot = SlotRef::new(index).context("slot index out of range")?;

            if spec.size == 0 {
                bail!("variable {name} has size 0");
            }
            decls
                .declare(slot, spec.size, spec.off)
                .with_context(|| format!("variable {name}"))?;
            slots.insert(name.clone(), slot);
        }
        Ok((decls, slots))
    }

    fn frame_config(&self) -> anyhow::Result<FrameConfig> {
        check_field("receiver.len", self.receiver.len)?;
        check_field("receiver.tag", self.receiver.tag)?;
        check_field("receiver.error_msg_len", self.receiver.error_msg_len)?;
        Ok(FrameConfig {
            len: self.receiver.len.into(),
            tag: self.receiver.tag.into(),
            error_tag: self.receiver.error_tag,
            error_msg_len: self.receiver.error_msg_len.into(),
            error_msg_off: self.receiver.error_msg_off,
        })
    }
}

fn check_field(name: &str, spec: FieldSpec) -> anyhow::Result<()> {
    if !matches!(spec.size, 1 | 2 | 4 | 8) {
        bail!("{name}.size must be 1, 2, 4 or 8 (got {})", spec.size);
    }
    Ok(())
}

fn store_value(
    store: &mut VarStore,
    slot: SlotRef,
    decls: &VarDecls,
    value: &toml::Value,
) -> anyhow::Result<()> {
    let size = decls.size(slot) as u32;
    match value {
        toml::Value::Integer(v) => store.set_uint(slot.cell(), size, *v as u64)?,
        toml::Value::String(s) => store.set_bytes(slot.cell(), size, s.as_bytes())?,
        other => bail!("unsupported value type: {}", other.type_str()),
    }
    Ok(())
}

fn build_flow(
    specs: &[PacketSpec],
    slots: &BTreeMap<String, SlotRef>,
) -> anyhow::Result<Vec<Packet>> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| build_packet(spec, slots).with_context(|| format!("packet {index}")))
        .collect()
}

fn build_packet(spec: &PacketSpec, slots: &BTreeMap<String, SlotRef>) -> anyhow::Result<Packet> {
    let payload = parse_hex(&spec.pkt)?;
    let mut packet = Packet::from_payload(&payload)?;
    packet.answer_tag = spec.answer_tag;

    for name in &spec.vars {
        let slot = *slots
            .get(name)
            .with_context(|| format!("unknown variable: {name}"))?;
        packet.push_var(slot)?;
    }
    for action in &spec.actions {
        let op = Operator::parse(&action.op)
            .with_context(|| format!("unknown operator: {}", action.op))?;
        let target = *slots
            .get(&action.name)
            .with_context(|| format!("unknown variable: {}", action.name))?;
        if target.is_global() {
            bail!("can't modify global variable with action: {}", action.name);
        }
        packet.push_action(Action { op, target })?;
    }
    Ok(packet)
}

fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    if !s.is_ascii() {
        bail!("packet string is not hex");
    }
    if s.len() % 2 != 0 {
        bail!("packet string ends with a half byte");
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16)
            .with_context(|| format!("invalid hex at offset {i}"))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> String {
        r#"
            [variables]
            counter = { off = 16, size = 2 }
            source = { off = 8, size = 4 }

            [global]
            source = 1

            [[sessions]]
            counter = 256

            [[sessions]]
            counter = 512

            [[flow.prelude]]
            pkt = "0102030405060708"
            answer_tag = 7

            [[flow.main]]
            pkt = "0000000000000000000000000000000000000000000000000000000000000000"
            vars = ["source", "counter"]
            actions = [{ op = "inc", name = "counter" }]

            [sender]
            cores = [0, 1]
            [sender.session]
            interval_ns = 1000000
            start_off_inc_ns = 500000

            [receiver]
            core = 2
            error_tag = 255
            error_msg_off = 8
            len = { off = 0, size = 2 }
            tag = { off = 2, size = 4 }
            error_msg_len = { off = 6, size = 2 }
        "#
        .to_string()
    }

    #[test]
    fn builds_a_round_robin_plan() {
        let config = LoadConfig::parse(&base_config()).unwrap();
        let plan = config.build(None).unwrap();

        assert_eq!(plan.senders.len(), 2);
        assert_eq!(plan.senders[0].core, 0);
        assert_eq!(plan.senders[1].core, 1);
        // round-robin distribution with staggered offsets
        assert_eq!(plan.senders[0].sessions.len(), 1);
        assert_eq!(plan.senders[1].sessions.len(), 1);
        assert_eq!(plan.senders[0].sessions[0].start_off_ns, 0);
        assert_eq!(plan.senders[1].sessions[0].start_off_ns, 500_000);
        assert_eq!(plan.senders[0].sessions[0].interval_ns, 1_000_000);

        // "source" is in [global] and sorts after "counter", yet takes the
        // first global slot; "counter" takes the first local slot.
        assert_eq!(&plan.globals.cell(0)[..4], &[1, 0, 0, 0]);
        assert_eq!(&plan.senders[0].sessions[0].vars.cell(0)[..2], &[0, 1]);
        assert_eq!(&plan.senders[1].sessions[0].vars.cell(0)[..2], &[0, 2]);

        assert_eq!(plan.receiver_core, 2);
        assert_eq!(plan.frame.error_tag, 255);
    }

    #[test]
    fn sender_cap_truncates_before_distribution() {
        let config = LoadConfig::parse(&base_config()).unwrap();
        let plan = config.build(Some(1)).unwrap();

        assert_eq!(plan.senders.len(), 1);
        // both sessions land on the surviving sender
        assert_eq!(plan.senders[0].sessions.len(), 2);
        assert_eq!(plan.senders[0].sessions[1].start_off_ns, 500_000);
    }

    #[test]
    fn session_cap_limits_consumption() {
        let raw = base_config().replace("cores = [0, 1]", "cores = [0]\nsessions = 1");
        let config = LoadConfig::parse(&raw).unwrap();
        let plan = config.build(None).unwrap();
        assert_eq!(plan.senders[0].sessions.len(), 1);
    }

    #[test]
    fn rejects_global_write_from_session() {
        let raw = base_config().replace("counter = 256", "source = 5");
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(
            err.to_string()
                .contains("accessing a global variable from a local context"),
            "{err}"
        );
    }

    #[test]
    fn rejects_action_on_global() {
        let raw = base_config().replace(
            r#"actions = [{ op = "inc", name = "counter" }]"#,
            r#"actions = [{ op = "inc", name = "source" }]"#,
        );
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("can't modify global variable"), "{err:#}");
    }

    #[test]
    fn rejects_unknown_operator() {
        let raw = base_config().replace(r#"op = "inc""#, r#"op = "dec""#);
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("unknown operator: dec"), "{err:#}");
    }

    #[test]
    fn rejects_unknown_variable_reference() {
        let raw = base_config().replace(r#"vars = ["source", "counter"]"#, r#"vars = ["missing"]"#);
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("unknown variable: missing"), "{err:#}");
    }

    #[test]
    fn rejects_odd_length_hex() {
        let raw = base_config().replace("0102030405060708", "010203040506070");
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("half byte"), "{err:#}");
    }

    #[test]
    fn rejects_empty_main_flow() {
        let config = LoadConfig::parse(&base_config()).unwrap();
        let mut stripped = config;
        stripped.flow.main.clear();
        let err = stripped.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("flow.main"), "{err:#}");
    }

    #[test]
    fn rejects_more_cores_than_sessions() {
        let raw = base_config().replace("cores = [0, 1]", "cores = [0, 1, 2]");
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("has no sessions"), "{err:#}");
    }

    #[test]
    fn rejects_too_many_globals() {
        let mut variables = String::new();
        let mut globals = String::new();
        for i in 0..9 {
            variables.push_str(&format!("g{i} = {{ off = {i}, size = 1 }}\n"));
            globals.push_str(&format!("g{i} = 0\n"));
        }
        let raw = base_config()
            .replace(
                "counter = { off = 16, size = 2 }\n            source = { off = 8, size = 4 }",
                &format!("counter = {{ off = 16, size = 2 }}\n{variables}"),
            )
            .replace("source = 1", &globals)
            .replace(r#"vars = ["source", "counter"]"#, r#"vars = ["counter"]"#);
        let config = LoadConfig::parse(&raw).unwrap();
        let err = config.build(None).unwrap_err();
        assert!(format!("{err:#}").contains("too many global variables"), "{err:#}");
    }

    #[test]
    fn decodes_mixed_case_hex() {
        assert_eq!(parse_hex("DeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex("0g").is_err());
    }

    #[test]
    fn string_values_are_truncated_to_size() {
        let raw = base_config().replace("source = 1", r#"source = "ABCDEFGH""#);
        let config = LoadConfig::parse(&raw).unwrap();
        let plan = config.build(None).unwrap();
        assert_eq!(&plan.globals.cell(0)[..5], b"ABCD\0");
    }
}
