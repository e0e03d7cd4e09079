//! Run-time variable registry.

use std::collections::HashMap;

use netbee_expr::VariableKind;
use netbee_protodb::{NodeData, ProtocolDatabase, Validity};

use crate::eval::{EvalError, Value};

#[derive(Debug, Clone)]
struct Variable {
    kind: VariableKind,
    validity: Validity,
    size: u32,
    value: Value,
}

/// Named typed storage, seeded from the database's declarations. `static`
/// variables persist across packets, `thispacket` ones are re-zeroed at
/// every packet boundary.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: HashMap<String, Variable>,
}

fn zero_value(kind: VariableKind) -> Value {
    match kind {
        VariableKind::Number | VariableKind::Protocol => Value::Number(0),
        VariableKind::Buffer | VariableKind::RefBuffer => Value::Bytes(Vec::new()),
    }
}

impl VariableStore {
    pub fn from_database(db: &ProtocolDatabase) -> Self {
        let mut vars = HashMap::new();
        for id in db.node_ids() {
            if let NodeData::Variable {
                name,
                kind,
                validity,
                size,
                init_number,
                init_bytes,
            } = &db.node(id).data
            {
                let value = match (init_number, init_bytes) {
                    (Some(n), _) => Value::Number(*n),
                    (_, Some(b)) => Value::Bytes(b.clone()),
                    _ => zero_value(*kind),
                };
                vars.insert(
                    name.clone(),
                    Variable {
                        kind: *kind,
                        validity: *validity,
                        size: *size,
                        value,
                    },
                );
            }
        }
        VariableStore { vars }
    }

    /// Packet boundary: per-packet variables go back to zero.
    pub fn reset_packet(&mut self) {
        for var in self.vars.values_mut() {
            if var.validity == Validity::ThisPacket {
                var.value = zero_value(var.kind);
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<&Value, EvalError> {
        self.vars
            .get(name)
            .map(|v| &v.value)
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))
    }

    /// Whole-value write; the kind was checked at load time.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))?;
        var.value = value;
        Ok(())
    }

    /// Write a sub-range of a buffer variable. The buffer grows to its
    /// declared size on first sliced write.
    pub fn set_slice(
        &mut self,
        name: &str,
        start: u32,
        len: u32,
        bytes: &[u8],
    ) -> Result<(), EvalError> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))?;

        let buffer = match &mut var.value {
            Value::Bytes(buffer) => buffer,
            _ => return Err(EvalError::KindMismatch),
        };

        let start = start as usize;
        let len = len as usize;
        let end = start + len;
        if end > var.size as usize {
            return Err(EvalError::SliceOutOfRange { start: start as u32, len: len as u32 });
        }
        if buffer.len() < end {
            buffer.resize(var.size as usize, 0);
        }

        let copied = len.min(bytes.len());
        buffer[start..start + copied].copy_from_slice(&bytes[..copied]);
        for b in &mut buffer[start + copied..end] {
            *b = 0;
        }
        Ok(())
    }

    /// Seed a packet-header variable if the database declares it.
    pub fn seed(&mut self, name: &str, value: u32) {
        if let Some(var) = self.vars.get_mut(name) {
            var.value = Value::Number(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbee_protodb::{load_xml, LoadFlags};

    fn db() -> ProtocolDatabase {
        load_xml(
            r#"
<netpdl name="t" version="0.2">
  <variable name="$keep" type="number" validity="static" value="7"/>
  <variable name="$gone" type="number" validity="thispacket" value="3"/>
  <variable name="$buf" type="buffer" validity="thispacket" size="4"/>
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#,
            LoadFlags::FULL,
        )
        .unwrap()
    }

    #[test]
    fn initializers_apply() {
        let store = VariableStore::from_database(&db());
        assert!(matches!(store.get("keep").unwrap(), Value::Number(7)));
        assert!(matches!(store.get("gone").unwrap(), Value::Number(3)));
    }

    #[test]
    fn packet_reset_clears_only_per_packet_variables() {
        let mut store = VariableStore::from_database(&db());
        store.set("keep", Value::Number(99)).unwrap();
        store.set("gone", Value::Number(99)).unwrap();

        store.reset_packet();

        assert!(matches!(store.get("keep").unwrap(), Value::Number(99)));
        assert!(matches!(store.get("gone").unwrap(), Value::Number(0)));
    }

    #[test]
    fn sliced_writes_stay_inside_the_declared_size() {
        let mut store = VariableStore::from_database(&db());
        store.set_slice("buf", 1, 2, b"ab").unwrap();
        match store.get("buf").unwrap() {
            Value::Bytes(bytes) => assert_eq!(bytes, &vec![0, b'a', b'b', 0]),
            other => panic!("{other:?}"),
        }

        assert!(store.set_slice("buf", 3, 2, b"zz").is_err());
    }
}
