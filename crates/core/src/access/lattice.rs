//! Algebra over permission values.
//!
//! Every permission is a fixed-size record of six independent slots (read,
//! update, create, delete, schema edit, one reserved), each drawn from a
//! small lattice. Merging is ordered: earlier operands dominate, which is
//! how rule order implements first-match-wins.

/// Value of one permission slot while evidence is still incomplete.
///
/// `AllowSome`/`DenySome` mean the deciding rule needs row data that was not
/// available at evaluation time. `Mixed` means records or columns disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermState {
  Unset,
  Allow,
  Deny,
  AllowSome,
  DenySome,
  Mixed,
}

/// Value of one slot once all available information is in hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixedState {
  Allow,
  Deny,
  Mixed,
}

/// Read slot of a table-level verdict. `MixedColumns` means every column is
/// decided without row data, just not uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableReadState {
  Allow,
  Deny,
  Mixed,
  MixedColumns,
}

pub const BIT_COUNT: usize = 6;

/// One of the six permission slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionBit {
  Read,
  Update,
  Create,
  Delete,
  SchemaEdit,
  Reserved,
}

pub const ALL_BITS: [PermissionBit; BIT_COUNT] = [
  PermissionBit::Read,
  PermissionBit::Update,
  PermissionBit::Create,
  PermissionBit::Delete,
  PermissionBit::SchemaEdit,
  PermissionBit::Reserved,
];

/// Fixed-size record of six slot values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermissionSet<T> {
  pub read: T,
  pub update: T,
  pub create: T,
  pub delete: T,
  pub schema_edit: T,
  // Reserved slot; carried through merges but has no surface today.
  pub reserved: T,
}

pub type PartialPermissionSet = PermissionSet<PermState>;
pub type MixedPermissionSet = PermissionSet<MixedState>;

/// Table-level verdict: the read slot distinguishes column-only mixing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TablePermissionSet {
  pub read: TableReadState,
  pub update: MixedState,
  pub create: MixedState,
  pub delete: MixedState,
  pub schema_edit: MixedState,
  pub reserved: MixedState,
}

impl<T: Copy> PermissionSet<T> {
  pub fn uniform(value: T) -> Self {
    return PermissionSet {
      read: value,
      update: value,
      create: value,
      delete: value,
      schema_edit: value,
      reserved: value,
    };
  }

  pub fn get(&self, bit: PermissionBit) -> T {
    return match bit {
      PermissionBit::Read => self.read,
      PermissionBit::Update => self.update,
      PermissionBit::Create => self.create,
      PermissionBit::Delete => self.delete,
      PermissionBit::SchemaEdit => self.schema_edit,
      PermissionBit::Reserved => self.reserved,
    };
  }

  pub fn set(&mut self, bit: PermissionBit, value: T) {
    match bit {
      PermissionBit::Read => self.read = value,
      PermissionBit::Update => self.update = value,
      PermissionBit::Create => self.create = value,
      PermissionBit::Delete => self.delete = value,
      PermissionBit::SchemaEdit => self.schema_edit = value,
      PermissionBit::Reserved => self.reserved = value,
    }
  }

  pub fn map<U>(&self, f: impl Fn(T) -> U) -> PermissionSet<U> {
    return PermissionSet {
      read: f(self.read),
      update: f(self.update),
      create: f(self.create),
      delete: f(self.delete),
      schema_edit: f(self.schema_edit),
      reserved: f(self.reserved),
    };
  }

  pub fn zip_with<U: Copy, V>(
    &self,
    other: &PermissionSet<U>,
    f: impl Fn(T, U) -> V,
  ) -> PermissionSet<V> {
    return PermissionSet {
      read: f(self.read, other.read),
      update: f(self.update, other.update),
      create: f(self.create, other.create),
      delete: f(self.delete, other.delete),
      schema_edit: f(self.schema_edit, other.schema_edit),
      reserved: f(self.reserved, other.reserved),
    };
  }
}

impl MixedPermissionSet {
  pub fn all_allow(&self) -> bool {
    return ALL_BITS.iter().all(|bit| self.get(*bit) == MixedState::Allow);
  }
}

/// The identity permission set.
pub fn empty() -> PartialPermissionSet {
  return PartialPermissionSet::uniform(PermState::Unset);
}

/// Slot-wise merge of two states, earlier operand dominating.
///
/// A final value in `a` wins outright. A partial in `a` combines with a
/// later value: same-direction evidence collapses, conflicting evidence is
/// `Mixed` (the outcome depends on row data).
pub fn merge_state(a: PermState, b: PermState) -> PermState {
  use PermState::*;
  return match (a, b) {
    (Allow, _) | (Deny, _) => a,
    (Unset, _) => b,
    (_, Unset) => a,
    (Mixed, _) | (_, Mixed) => Mixed,
    (AllowSome, Allow) => Allow,
    (AllowSome, AllowSome) => AllowSome,
    (DenySome, Deny) => Deny,
    (DenySome, DenySome) => DenySome,
    (AllowSome, Deny) | (AllowSome, DenySome) | (DenySome, Allow) | (DenySome, AllowSome) => Mixed,
  };
}

/// Ordered merge of two permission sets; associative, not commutative.
pub fn merge(a: &PartialPermissionSet, b: &PartialPermissionSet) -> PartialPermissionSet {
  return a.zip_with(b, merge_state);
}

/// Collapse leftover partial evidence once all inputs are in hand. `Unset`
/// closes to `Deny`; in practice the built-in document default resolves
/// every slot before this is reached.
pub fn to_mixed(p: &PartialPermissionSet) -> MixedPermissionSet {
  return p.map(|state| match state {
    PermState::Allow | PermState::AllowSome => MixedState::Allow,
    PermState::Deny | PermState::DenySome | PermState::Unset => MixedState::Deny,
    PermState::Mixed => MixedState::Mixed,
  });
}

/// Weaken final bits to their row-dependent forms. Applied to a rule's
/// permission delta when its predicate needed row data that was absent.
pub fn weaken(p: &PartialPermissionSet) -> PartialPermissionSet {
  return p.map(|state| match state {
    PermState::Allow => PermState::AllowSome,
    PermState::Deny => PermState::DenySome,
    other => other,
  });
}

/// Three-valued reduce: uniform final value or `Mixed`.
pub fn mixed_reduce(values: impl IntoIterator<Item = MixedState>) -> MixedState {
  let mut iter = values.into_iter();
  let Some(first) = iter.next() else {
    return MixedState::Allow;
  };
  if first == MixedState::Mixed {
    return MixedState::Mixed;
  }
  for value in iter {
    if value != first {
      return MixedState::Mixed;
    }
  }
  return first;
}

/// Combine column-scoped verdicts into a table-level verdict.
///
/// The read slot keeps column-only disagreement distinguishable from
/// row-dependence; all other slots reduce to the three-valued set.
pub fn fold_table(verdicts: &[MixedPermissionSet]) -> TablePermissionSet {
  debug_assert!(!verdicts.is_empty());

  let read = {
    let any_mixed = verdicts.iter().any(|v| v.read == MixedState::Mixed);
    if any_mixed {
      TableReadState::Mixed
    } else if verdicts.iter().all(|v| v.read == MixedState::Allow) {
      TableReadState::Allow
    } else if verdicts.iter().all(|v| v.read == MixedState::Deny) {
      TableReadState::Deny
    } else {
      TableReadState::MixedColumns
    }
  };

  let slot = |bit: PermissionBit| mixed_reduce(verdicts.iter().map(|v| v.get(bit)));

  return TablePermissionSet {
    read,
    update: slot(PermissionBit::Update),
    create: slot(PermissionBit::Create),
    delete: slot(PermissionBit::Delete),
    schema_edit: slot(PermissionBit::SchemaEdit),
    reserved: slot(PermissionBit::Reserved),
  };
}

impl TablePermissionSet {
  /// Document-level view of this table verdict: column-only mixing is just
  /// mixing once tables are aggregated.
  pub fn to_mixed(&self) -> MixedPermissionSet {
    let read = match self.read {
      TableReadState::Allow => MixedState::Allow,
      TableReadState::Deny => MixedState::Deny,
      TableReadState::Mixed | TableReadState::MixedColumns => MixedState::Mixed,
    };
    return MixedPermissionSet {
      read,
      update: self.update,
      create: self.create,
      delete: self.delete,
      schema_edit: self.schema_edit,
      reserved: self.reserved,
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL_STATES: [PermState; 6] = [
    PermState::Unset,
    PermState::Allow,
    PermState::Deny,
    PermState::AllowSome,
    PermState::DenySome,
    PermState::Mixed,
  ];

  #[test]
  fn test_merge_is_associative() {
    for a in ALL_STATES {
      for b in ALL_STATES {
        for c in ALL_STATES {
          assert_eq!(
            merge_state(merge_state(a, b), c),
            merge_state(a, merge_state(b, c)),
            "associativity failed for {a:?}, {b:?}, {c:?}"
          );
        }
      }
    }
  }

  #[test]
  fn test_unset_is_identity() {
    for a in ALL_STATES {
      assert_eq!(merge_state(PermState::Unset, a), a);
      assert_eq!(merge_state(a, PermState::Unset), a);
    }

    let p = PartialPermissionSet {
      read: PermState::AllowSome,
      update: PermState::Deny,
      ..empty()
    };
    assert_eq!(to_mixed(&merge(&p, &empty())), to_mixed(&p));
  }

  #[test]
  fn test_earlier_operand_dominates() {
    assert_eq!(
      merge_state(PermState::Allow, PermState::Deny),
      PermState::Allow
    );
    assert_eq!(
      merge_state(PermState::Deny, PermState::Allow),
      PermState::Deny
    );
  }

  #[test]
  fn test_partial_evidence_resolution() {
    // Same-direction evidence collapses.
    assert_eq!(
      merge_state(PermState::AllowSome, PermState::Allow),
      PermState::Allow
    );
    assert_eq!(
      merge_state(PermState::DenySome, PermState::Deny),
      PermState::Deny
    );
    // Conflicting evidence depends on the row.
    assert_eq!(
      merge_state(PermState::AllowSome, PermState::Deny),
      PermState::Mixed
    );
    assert_eq!(
      merge_state(PermState::DenySome, PermState::Allow),
      PermState::Mixed
    );
  }

  #[test]
  fn test_weaken_downgrades_final_bits() {
    let p = PartialPermissionSet {
      read: PermState::Deny,
      update: PermState::Allow,
      create: PermState::AllowSome,
      ..empty()
    };
    let weak = weaken(&p);
    assert_eq!(weak.read, PermState::DenySome);
    assert_eq!(weak.update, PermState::AllowSome);
    assert_eq!(weak.create, PermState::AllowSome);
    assert_eq!(weak.delete, PermState::Unset);
  }

  #[test]
  fn test_to_mixed_collapses_leftovers() {
    let p = PartialPermissionSet {
      read: PermState::AllowSome,
      update: PermState::DenySome,
      create: PermState::Unset,
      ..empty()
    };
    let mixed = to_mixed(&p);
    assert_eq!(mixed.read, MixedState::Allow);
    assert_eq!(mixed.update, MixedState::Deny);
    assert_eq!(mixed.create, MixedState::Deny);
  }

  #[test]
  fn test_fold_table_read() {
    let allow = MixedPermissionSet::uniform(MixedState::Allow);
    let deny = MixedPermissionSet::uniform(MixedState::Deny);
    let mixed = MixedPermissionSet::uniform(MixedState::Mixed);

    assert_eq!(fold_table(&[allow, allow]).read, TableReadState::Allow);
    assert_eq!(fold_table(&[deny, deny]).read, TableReadState::Deny);
    assert_eq!(
      fold_table(&[allow, deny]).read,
      TableReadState::MixedColumns
    );
    assert_eq!(fold_table(&[allow, mixed]).read, TableReadState::Mixed);

    // Non-read slots reduce to the three-valued set.
    assert_eq!(fold_table(&[allow, deny]).update, MixedState::Mixed);
    assert_eq!(fold_table(&[allow, allow]).update, MixedState::Allow);
  }
}
