//! Atomic edits.
//!
//! An atomic edit is one path plus exactly one payload. The wire shape
//! follows JSON0: `{"p": ["data","fldN"], "od": 3, "oi": 4}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use easygrid_core::{Error, Result};

use crate::path::{Path, PathSeg};

/// The kind of an atomic edit, derived from which payloads are present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditKind {
    /// Insert a value at an object key (`oi`).
    Insert,
    /// Delete the value at an object key, checked against `od`.
    Delete,
    /// Replace the value at a path (`od` + `oi`).
    Replace,
    /// Insert into a list at an index (`li`).
    ListInsert,
    /// Delete from a list at an index, checked against `ld`.
    ListDelete,
    /// Move a list element from the path index to `lm`.
    ListMove,
    /// Add to the number at a path (`na`).
    NumberAdd,
}

/// One atomic edit of an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct AtomicEdit {
    /// Path into the document.
    pub p: Path,
    /// Object insert payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    /// Object delete payload (the expected current value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
    /// List insert payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub li: Option<Value>,
    /// List delete payload (the expected current element).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld: Option<Value>,
    /// List move target index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lm: Option<usize>,
    /// Numeric addend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub na: Option<f64>,
}

impl AtomicEdit {
    /// Object insert at `path`.
    pub fn insert(p: Path, value: Value) -> Self {
        Self {
            p,
            oi: Some(value),
            ..Default::default()
        }
    }

    /// Checked object delete at `path`.
    pub fn delete(p: Path, old: Value) -> Self {
        Self {
            p,
            od: Some(old),
            ..Default::default()
        }
    }

    /// Checked replace at `path`.
    pub fn replace(p: Path, old: Value, new: Value) -> Self {
        Self {
            p,
            od: Some(old),
            oi: Some(new),
            ..Default::default()
        }
    }

    /// Replace of a whole field cell, treating nulls as absence.
    ///
    /// A null old value degenerates to an insert, a null new value to a
    /// delete, so the edit stays applicable to documents where unset
    /// fields have no key at all.
    pub fn set_field(field_id: &str, old: Value, new: Value) -> Self {
        let p = Path::field(field_id);
        match (old.is_null(), new.is_null()) {
            (true, false) => Self::insert(p, new),
            (false, true) => Self::delete(p, old),
            _ => Self::replace(p, old, new),
        }
    }

    /// List insert at the path's final index.
    pub fn list_insert(p: Path, value: Value) -> Self {
        Self {
            p,
            li: Some(value),
            ..Default::default()
        }
    }

    /// Checked list delete at the path's final index.
    pub fn list_delete(p: Path, old: Value) -> Self {
        Self {
            p,
            ld: Some(old),
            ..Default::default()
        }
    }

    /// List move from the path's final index to `to`.
    pub fn list_move(p: Path, to: usize) -> Self {
        Self {
            p,
            lm: Some(to),
            ..Default::default()
        }
    }

    /// Numeric add at `path`.
    pub fn number_add(p: Path, addend: f64) -> Self {
        Self {
            p,
            na: Some(addend),
            ..Default::default()
        }
    }

    /// Classifies the edit, rejecting payload combinations that mean
    /// nothing.
    pub fn kind(&self) -> Result<EditKind> {
        let combo = (
            self.oi.is_some(),
            self.od.is_some(),
            self.li.is_some(),
            self.ld.is_some(),
            self.lm.is_some(),
            self.na.is_some(),
        );
        match combo {
            (true, true, false, false, false, false) => Ok(EditKind::Replace),
            (true, false, false, false, false, false) => Ok(EditKind::Insert),
            (false, true, false, false, false, false) => Ok(EditKind::Delete),
            (false, false, true, false, false, false) => Ok(EditKind::ListInsert),
            (false, false, false, true, false, false) => Ok(EditKind::ListDelete),
            (false, false, false, false, true, false) => Ok(EditKind::ListMove),
            (false, false, false, false, false, true) => Ok(EditKind::NumberAdd),
            _ => Err(Error::operation_invalid(format!(
                "edit at {} carries no single payload",
                self.p
            ))),
        }
    }

    /// Applies this edit to `root` in place.
    pub fn apply(&self, root: &mut Value) -> Result<()> {
        let kind = self.kind()?;
        if self.p.is_empty() {
            return Err(Error::operation_invalid("empty path"));
        }
        let (last, parents) = self.p.segs().split_last().expect("non-empty path");
        let parent = navigate_mut(root, parents, &self.p)?;

        match kind {
            EditKind::Insert => {
                let map = as_object_mut(parent, last, &self.p)?;
                let key = expect_key(last, &self.p)?;
                if map.contains_key(key) {
                    return Err(Error::operation_invalid(format!(
                        "insert at {} but a value is already present",
                        self.p
                    )));
                }
                map.insert(key.to_string(), self.oi.clone().expect("insert payload"));
            }
            EditKind::Delete => {
                let map = as_object_mut(parent, last, &self.p)?;
                let key = expect_key(last, &self.p)?;
                let current = map.get(key).ok_or_else(|| missing(&self.p))?;
                check_expected(current, self.od.as_ref().expect("delete payload"), &self.p)?;
                map.remove(key);
            }
            EditKind::Replace => {
                let slot = slot_mut(parent, last, &self.p)?;
                check_expected(slot, self.od.as_ref().expect("replace payload"), &self.p)?;
                *slot = self.oi.clone().expect("replace payload");
            }
            EditKind::ListInsert => {
                let index = expect_index(last, &self.p)?;
                let list = as_array_mut(parent, &self.p)?;
                if index > list.len() {
                    return Err(Error::operation_invalid(format!(
                        "list insert at {} beyond length {}",
                        self.p,
                        list.len()
                    )));
                }
                list.insert(index, self.li.clone().expect("list insert payload"));
            }
            EditKind::ListDelete => {
                let index = expect_index(last, &self.p)?;
                let list = as_array_mut(parent, &self.p)?;
                let current = list.get(index).ok_or_else(|| missing(&self.p))?;
                check_expected(current, self.ld.as_ref().expect("list delete payload"), &self.p)?;
                list.remove(index);
            }
            EditKind::ListMove => {
                let from = expect_index(last, &self.p)?;
                let to = self.lm.expect("list move payload");
                let list = as_array_mut(parent, &self.p)?;
                if from >= list.len() || to >= list.len() {
                    return Err(Error::operation_invalid(format!(
                        "list move {} -> {} out of bounds (len {})",
                        from,
                        to,
                        list.len()
                    )));
                }
                let item = list.remove(from);
                list.insert(to, item);
            }
            EditKind::NumberAdd => {
                let slot = slot_mut(parent, last, &self.p)?;
                let current = slot.as_f64().ok_or_else(|| {
                    Error::operation_invalid(format!("numeric add at {} on a non-number", self.p))
                })?;
                let sum = current + self.na.expect("numeric add payload");
                *slot = number(sum, &self.p)?;
            }
        }
        Ok(())
    }

    /// Returns the inverse edit.
    pub fn invert(&self) -> Result<AtomicEdit> {
        Ok(match self.kind()? {
            EditKind::Insert => AtomicEdit::delete(self.p.clone(), self.oi.clone().unwrap()),
            EditKind::Delete => AtomicEdit::insert(self.p.clone(), self.od.clone().unwrap()),
            EditKind::Replace => AtomicEdit::replace(
                self.p.clone(),
                self.oi.clone().unwrap(),
                self.od.clone().unwrap(),
            ),
            EditKind::ListInsert => {
                AtomicEdit::list_delete(self.p.clone(), self.li.clone().unwrap())
            }
            EditKind::ListDelete => {
                AtomicEdit::list_insert(self.p.clone(), self.ld.clone().unwrap())
            }
            EditKind::ListMove => {
                let from = self
                    .p
                    .last()
                    .and_then(PathSeg::as_index)
                    .ok_or_else(|| Error::operation_invalid("list move path must end in an index"))?;
                let to = self.lm.unwrap();
                let mut segs = self.p.segs().to_vec();
                *segs.last_mut().expect("non-empty path") = PathSeg::Index(to);
                AtomicEdit::list_move(Path::new(segs), from)
            }
            EditKind::NumberAdd => AtomicEdit::number_add(self.p.clone(), -self.na.unwrap()),
        })
    }

    /// Returns true when this edit overwrites a scalar path (replace or
    /// insert or delete of an object slot).
    pub fn is_scalar(&self) -> bool {
        matches!(
            self.kind(),
            Ok(EditKind::Insert) | Ok(EditKind::Delete) | Ok(EditKind::Replace)
        )
    }
}

fn missing(path: &Path) -> Error {
    Error::operation_invalid(format!("no value at {}", path))
}

fn expect_key<'a>(seg: &'a PathSeg, path: &Path) -> Result<&'a str> {
    seg.as_key()
        .ok_or_else(|| Error::operation_invalid(format!("{} addresses a list, not an object", path)))
}

fn expect_index(seg: &PathSeg, path: &Path) -> Result<usize> {
    seg.as_index()
        .ok_or_else(|| Error::operation_invalid(format!("{} addresses an object, not a list", path)))
}

fn navigate_mut<'a>(root: &'a mut Value, segs: &[PathSeg], path: &Path) -> Result<&'a mut Value> {
    let mut current = root;
    for seg in segs {
        current = match (seg, current) {
            (PathSeg::Key(key), Value::Object(map)) => {
                map.get_mut(key).ok_or_else(|| missing(path))?
            }
            (PathSeg::Index(index), Value::Array(items)) => {
                items.get_mut(*index).ok_or_else(|| missing(path))?
            }
            _ => return Err(missing(path)),
        };
    }
    Ok(current)
}

fn as_object_mut<'a>(
    parent: &'a mut Value,
    _last: &PathSeg,
    path: &Path,
) -> Result<&'a mut serde_json::Map<String, Value>> {
    parent
        .as_object_mut()
        .ok_or_else(|| Error::operation_invalid(format!("{} parent is not an object", path)))
}

fn as_array_mut<'a>(parent: &'a mut Value, path: &Path) -> Result<&'a mut Vec<Value>> {
    parent
        .as_array_mut()
        .ok_or_else(|| Error::operation_invalid(format!("{} parent is not a list", path)))
}

fn slot_mut<'a>(parent: &'a mut Value, last: &PathSeg, path: &Path) -> Result<&'a mut Value> {
    match (last, parent) {
        (PathSeg::Key(key), Value::Object(map)) => map.get_mut(key).ok_or_else(|| missing(path)),
        (PathSeg::Index(index), Value::Array(items)) => {
            items.get_mut(*index).ok_or_else(|| missing(path))
        }
        _ => Err(missing(path)),
    }
}

fn check_expected(current: &Value, expected: &Value, path: &Path) -> Result<()> {
    if current == expected {
        Ok(())
    } else {
        Err(Error::operation_invalid(format!(
            "value at {} does not match the expected old value",
            path
        )))
    }
}

fn number(value: f64, path: &Path) -> Result<Value> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| Error::operation_invalid(format!("numeric add at {} is not finite", path)))
}
