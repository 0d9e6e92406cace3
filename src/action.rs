//! Input-action stream (C5): ordered command objects mirroring the
//! link-line's stateful flags, grounded on `InputAction.h`'s
//! `InputActionKind` enumeration.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::input::Attributes;

#[derive(Debug, Clone)]
pub enum Action {
    InputFile(String),
    Namespec(String),
    StartGroup,
    EndGroup,
    WholeArchive,
    NoWholeArchive,
    AsNeeded,
    NoAsNeeded,
    BStatic,
    BDynamic,
    AddNeeded,
    NoAddNeeded,
    DefSym(String),
    InputFormat(String),
    Script(PathBuf),
    JustSymbols(String),
}

/// A materialized input produced by replaying the action stream: the
/// "current attribute set" at the point this entry was created, baked in so
/// downstream code never consults builder state (spec §9).
#[derive(Debug, Clone)]
pub struct MaterializedInput {
    pub kind: MaterializedKind,
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
pub enum MaterializedKind {
    File(String),
    Namespec(String),
    Script(PathBuf),
    DefSym(String),
    JustSymbols(String),
}

/// Delimits one `--start-group .. --end-group` region so the driver can
/// rescan its members to a fixpoint (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRange {
    pub start: usize,
    pub end: usize,
}

/// Replays an [`Action`] stream into a flat, attribute-stamped input list
/// plus the group ranges found within it. Group nesting is an error.
pub fn materialize(actions: &[Action]) -> Result<(Vec<MaterializedInput>, Vec<GroupRange>)> {
    let mut cur = Attributes::default();
    let mut inputs = Vec::new();
    let mut groups = Vec::new();
    let mut group_start: Option<usize> = None;

    for action in actions {
        match action {
            Action::InputFile(name) => inputs.push(MaterializedInput {
                kind: MaterializedKind::File(name.clone()),
                attributes: cur,
            }),
            Action::Namespec(name) => inputs.push(MaterializedInput {
                kind: MaterializedKind::Namespec(name.clone()),
                attributes: cur,
            }),
            Action::Script(path) => inputs.push(MaterializedInput {
                kind: MaterializedKind::Script(path.clone()),
                attributes: cur,
            }),
            Action::DefSym(expr) => inputs.push(MaterializedInput {
                kind: MaterializedKind::DefSym(expr.clone()),
                attributes: cur,
            }),
            Action::JustSymbols(name) => {
                let mut attrs = cur;
                attrs.just_symbols = true;
                inputs.push(MaterializedInput {
                    kind: MaterializedKind::JustSymbols(name.clone()),
                    attributes: attrs,
                });
            }
            Action::StartGroup => {
                if group_start.is_some() {
                    return Err(anyhow!("nested --start-group is not allowed"));
                }
                group_start = Some(inputs.len());
            }
            Action::EndGroup => {
                let start = group_start
                    .take()
                    .ok_or_else(|| anyhow!("--end-group without matching --start-group"))?;
                groups.push(GroupRange {
                    start,
                    end: inputs.len(),
                });
            }
            Action::WholeArchive => cur.whole_archive = true,
            Action::NoWholeArchive => cur.whole_archive = false,
            Action::AsNeeded => cur.as_needed = true,
            Action::NoAsNeeded => cur.as_needed = false,
            Action::BStatic => cur.static_link = true,
            Action::BDynamic => cur.static_link = false,
            Action::AddNeeded => cur.add_needed = true,
            Action::NoAddNeeded => cur.add_needed = false,
            Action::InputFormat(_) => {
                // Recorded only to steer the reader's expected container
                // format; carries no attribute state of its own.
            }
        }
    }

    if group_start.is_some() {
        return Err(anyhow!("--start-group without matching --end-group"));
    }

    Ok((inputs, groups))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_at_creation_are_stamped_per_input() {
        let actions = vec![
            Action::Namespec("a".into()),
            Action::AsNeeded,
            Action::Namespec("b".into()),
            Action::NoAsNeeded,
            Action::Namespec("c".into()),
        ];
        let (inputs, _) = materialize(&actions).unwrap();
        assert_eq!(inputs.len(), 3);
        assert!(!inputs[0].attributes.as_needed);
        assert!(inputs[1].attributes.as_needed);
        assert!(!inputs[2].attributes.as_needed);
    }

    #[test]
    fn nested_group_is_rejected() {
        let actions = vec![Action::StartGroup, Action::StartGroup];
        assert!(materialize(&actions).is_err());
    }

    #[test]
    fn unterminated_group_is_rejected() {
        let actions = vec![Action::StartGroup, Action::Namespec("a".into())];
        assert!(materialize(&actions).is_err());
    }

    #[test]
    fn group_range_is_recorded() {
        let actions = vec![
            Action::StartGroup,
            Action::Namespec("a".into()),
            Action::Namespec("b".into()),
            Action::EndGroup,
        ];
        let (inputs, groups) = materialize(&actions).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(groups, vec![GroupRange { start: 0, end: 2 }]);
    }
}
