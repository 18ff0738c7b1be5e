use hashbrown::HashSet;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Shared, possibly cyclic aggregate handle. Two handles denote the same
/// aggregate exactly when they point at the same allocation.
pub type TableRef = Rc<RefCell<Table>>;

/// A value in the universe the codec understands. `Nil` is the one member
/// the codec refuses: table entries keyed or valued with it are dropped on
/// encode, and a top-level `Nil` is an unsupported-type error. The client
/// uses it to express "delete" on `set`.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Table(TableRef),
}

impl Value {
    #[inline]
    pub fn str(bytes: impl Into<Vec<u8>>) -> Value {
        Value::Str(bytes.into())
    }

    #[inline]
    pub fn table(table: Table) -> Value {
        Value::Table(Rc::new(RefCell::new(table)))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Cycle-safe structural equality: floats bitwise (NaN equals NaN),
    /// aggregates compared entry by entry in iteration order, with visited
    /// handle pairs memoized so shared and cyclic graphs terminate.
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut visited = HashSet::new();
        deep_eq_inner(self, other, &mut visited)
    }
}

fn deep_eq_inner(a: &Value, b: &Value, visited: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Table(left), Value::Table(right)) => {
            let pair = (Rc::as_ptr(left) as usize, Rc::as_ptr(right) as usize);

            // A revisited pair is equal by coinduction; any mismatch below
            // it would already have failed on the first visit.
            if !visited.insert(pair) {
                return true;
            }

            let left = left.borrow();
            let right = right.borrow();

            // Compared as keyed entry sequences; how entries split between
            // the array and record parts is a storage detail.
            if left.array.len() + left.record.len() != right.array.len() + right.record.len() {
                return false;
            }

            let result = left.entries().zip(right.entries()).all(|((lk, lv), (rk, rv))| {
                deep_eq_inner(&lk, &rk, visited) && deep_eq_inner(lv, rv, visited)
            });
            result
        }
        _ => a == b,
    }
}

/// Key identity for record lookups: scalars structurally (floats by bit
/// pattern, so NaN is a usable key), tables by handle identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => state.write_u8(0),
            Value::Bool(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            Value::Int(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            Value::Float(v) => {
                state.write_u8(3);
                v.to_bits().hash(state);
            }
            Value::Str(v) => {
                state.write_u8(4);
                v.hash(state);
            }
            Value::Table(v) => {
                state.write_u8(5);
                (Rc::as_ptr(v) as usize).hash(state);
            }
        }
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Value {
        Value::Str(v.as_bytes().to_vec())
    }
}

impl From<TableRef> for Value {
    #[inline]
    fn from(v: TableRef) -> Value {
        Value::Table(v)
    }
}

/// A finite aggregate with an array part (values at keys `1..=N`) and a
/// record part (everything else, in insertion order).
#[derive(Debug, Clone, Default)]
pub struct Table {
    array: Vec<Value>,
    record: IndexMap<Value, Value>,
}

impl Table {
    #[inline]
    pub fn new() -> Table {
        Table::default()
    }

    /// Wraps the table in a shareable handle.
    #[inline]
    pub fn share(self) -> TableRef {
        Rc::new(RefCell::new(self))
    }

    #[inline]
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn record_len(&self) -> usize {
        self.record.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.record.is_empty()
    }

    /// Appends to the array part.
    #[inline]
    pub fn push(&mut self, value: impl Into<Value>) {
        self.array.push(value.into());
    }

    /// Inserts an entry. While the record part is empty, a key equal to
    /// `array_len() + 1` extends the array part; everything else lands in
    /// the record part. This mirrors how the codec classifies entries, so
    /// a decoded table reports the same parts the encoder saw.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();

        if self.record.is_empty() {
            if let Value::Int(index) = key {
                if index >= 1 && index as u64 == self.array.len() as u64 + 1 {
                    self.array.push(value.into());
                    return;
                }
            }
        }

        self.record.insert(key, value.into());
    }

    /// Looks a key up in either part.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        if let Value::Int(index) = key {
            if *index >= 1 && (*index as u64) <= self.array.len() as u64 {
                return Some(&self.array[(*index - 1) as usize]);
            }
        }

        self.record.get(key)
    }

    /// All entries as key/value pairs, array part first.
    pub fn entries(&self) -> impl Iterator<Item = (Value, &Value)> {
        self.array
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Int(i as i64 + 1), v))
            .chain(self.record.iter().map(|(k, v)| (k.clone(), v)))
    }
}
