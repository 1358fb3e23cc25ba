use crate::value::{ArrayBuffer, Value};

/// A value paired with the buffers whose ownership should move, rather than
/// be copied, when it crosses the channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Movable {
    pub value: Value,
    pub transfer_list: Vec<ArrayBuffer>,
}

impl Movable {
    pub fn new(
        value: impl Into<Value>,
        transfer_list: impl IntoIterator<Item = ArrayBuffer>,
    ) -> Self {
        Self {
            value: value.into(),
            transfer_list: transfer_list.into_iter().collect(),
        }
    }

    pub fn into_parts(self) -> (Value, Vec<ArrayBuffer>) {
        (self.value, self.transfer_list)
    }
}

impl From<Value> for Movable {
    fn from(value: Value) -> Self {
        Self {
            value,
            transfer_list: Vec::new(),
        }
    }
}

/// Marks `transfer_list` buffers of `value` for zero-copy handoff.
pub fn move_value(
    value: impl Into<Value>,
    transfer_list: impl IntoIterator<Item = ArrayBuffer>,
) -> Movable {
    Movable::new(value, transfer_list)
}
