//! Correlates commands with their results, see `spec.md` sections 3 and 4.5.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use ten_runtime_protocol::{CmdId, Loc};

use crate::message::Message;

/// A callback invoked with the (possibly synthesised) result for an OUT path.
pub type ResultHandler = Box<dyn FnOnce(Message) + Send>;

/// Fan-out propagation policy for a [`PathGroup`], see `spec.md` section 4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    /// Propagate on the first non-OK result, or the last OK result; forward
    /// whichever result triggered propagation.
    OneFailReturnAndAllOkReturnLast,
    /// Propagate on the first non-OK result, or the first OK result; forward
    /// the first result that ever arrived.
    OneFailReturnAndAllOkReturnFirst,
}

/// A record of one command in transit, see `spec.md` section 3.
pub struct Path {
    pub cmd_id: CmdId,
    pub cmd_name: String,
    pub original_src: Loc,
    pub original_seq_id: Option<u64>,
    pub created_at: Instant,
    pub expire_at: Option<Instant>,
}

struct OutSingle {
    path: Path,
    handler: ResultHandler,
}

struct OutGrouped {
    path: Path,
    group_id: u64,
}

enum OutEntry {
    Single(OutSingle),
    Grouped(OutGrouped),
}

struct Group {
    policy: GroupPolicy,
    members: Vec<CmdId>,
    first_result: Option<Message>,
    ok_count: usize,
    handler: Option<ResultHandler>,
}

/// Per-extension bookkeeping that correlates `cmd_id` across IN and OUT
/// paths, see `spec.md` section 4.5.
#[derive(Default)]
pub struct PathTable {
    in_paths: IndexMap<CmdId, Path>,
    out_paths: IndexMap<CmdId, OutEntry>,
    groups: IndexMap<u64, Group>,
    next_group_id: u64,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an inbound cmd, creating exactly one IN-path entry.
    pub fn add_in_path(
        &mut self,
        cmd_id: CmdId,
        cmd_name: impl Into<String>,
        original_src: Loc,
        original_seq_id: Option<u64>,
        timeout: Option<Duration>,
    ) {
        let now = Instant::now();
        self.in_paths.insert(
            cmd_id,
            Path {
                cmd_id,
                cmd_name: cmd_name.into(),
                original_src,
                original_seq_id,
                created_at: now,
                expire_at: timeout.map(|d| now + d),
            },
        );
    }

    /// Removes and returns the IN-path for `cmd_id`, as happens when the
    /// corresponding cmd_result leaves the extension on the backward path.
    pub fn take_in_path(&mut self, cmd_id: CmdId) -> Option<Path> {
        self.in_paths.shift_remove(&cmd_id)
    }

    /// Records an outbound cmd to a single destination, creating one OUT-path.
    pub fn add_out_path(
        &mut self,
        cmd_id: CmdId,
        cmd_name: impl Into<String>,
        original_src: Loc,
        timeout: Option<Duration>,
        handler: ResultHandler,
    ) {
        let now = Instant::now();
        let path = Path {
            cmd_id,
            cmd_name: cmd_name.into(),
            original_src,
            original_seq_id: None,
            created_at: now,
            expire_at: timeout.map(|d| now + d),
        };
        self.out_paths
            .insert(cmd_id, OutEntry::Single(OutSingle { path, handler }));
    }

    /// Records a fanned-out cmd's OUT-paths as one [`PathGroup`], see
    /// `spec.md` section 4.4 step 6.
    pub fn add_out_path_group(
        &mut self,
        cmd_ids: Vec<CmdId>,
        cmd_name: impl Into<String>,
        original_src: Loc,
        timeout: Option<Duration>,
        policy: GroupPolicy,
        handler: ResultHandler,
    ) -> u64 {
        let group_id = self.next_group_id;
        self.next_group_id += 1;

        let cmd_name = cmd_name.into();
        let now = Instant::now();
        for &cmd_id in &cmd_ids {
            let path = Path {
                cmd_id,
                cmd_name: cmd_name.clone(),
                original_src: original_src.clone(),
                original_seq_id: None,
                created_at: now,
                expire_at: timeout.map(|d| now + d),
            };
            self.out_paths
                .insert(cmd_id, OutEntry::Grouped(OutGrouped { path, group_id }));
        }

        self.groups.insert(
            group_id,
            Group {
                policy,
                members: cmd_ids,
                first_result: None,
                ok_count: 0,
                handler: Some(handler),
            },
        );
        group_id
    }

    /// Looks up the cmd name an OUT-path was opened under, without resolving
    /// it, so a caller can schema-check an arriving result before deciding
    /// its final status.
    pub fn out_path_cmd_name(&self, cmd_id: CmdId) -> Option<&str> {
        match self.out_paths.get(&cmd_id)? {
            OutEntry::Single(single) => Some(single.path.cmd_name.as_str()),
            OutEntry::Grouped(grouped) => Some(grouped.path.cmd_name.as_str()),
        }
    }

    /// Resolves an arriving cmd_result against the OUT-path for its
    /// `correlates_to` id, invoking the result handler (for a single path,
    /// immediately; for a grouped path, only once the group's policy decides
    /// to propagate). Returns whether the path(s) involved were fully
    /// resolved and removed.
    pub fn resolve_out_path(&mut self, cmd_id: CmdId, is_final: bool, is_ok: bool, result: Message) -> bool {
        let Some(entry) = self.out_paths.get(&cmd_id) else {
            return false;
        };

        match entry {
            OutEntry::Single(_) => {
                if !is_final {
                    // Only the final result unroots the path, per spec.md section 4.5.
                    // An `FnOnce` handler can only fire once, so intermediate
                    // streamed results are not delivered through it.
                    return false;
                }
                let Some(OutEntry::Single(single)) = self.out_paths.shift_remove(&cmd_id) else {
                    unreachable!("matched Single above");
                };
                (single.handler)(result);
                true
            }
            OutEntry::Grouped(grouped) => {
                let group_id = grouped.group_id;
                self.resolve_grouped(group_id, cmd_id, is_ok, result)
            }
        }
    }

    fn resolve_grouped(&mut self, group_id: u64, cmd_id: CmdId, is_ok: bool, result: Message) -> bool {
        let propagate = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return false;
            };
            if group.first_result.is_none() {
                group.first_result = Some(result.clone());
            }
            if is_ok {
                group.ok_count += 1;
            }

            let all_ok_in = group.ok_count == group.members.len();
            match group.policy {
                GroupPolicy::OneFailReturnAndAllOkReturnLast => {
                    if !is_ok {
                        Some(result.clone())
                    } else if all_ok_in {
                        Some(result)
                    } else {
                        None
                    }
                }
                GroupPolicy::OneFailReturnAndAllOkReturnFirst => {
                    if !is_ok || group.ok_count == 1 {
                        group.first_result.clone()
                    } else {
                        None
                    }
                }
            }
        };

        let Some(forwarded) = propagate else {
            return false;
        };

        let Some(group) = self.groups.shift_remove(&group_id) else {
            return false;
        };
        for member in &group.members {
            self.out_paths.shift_remove(member);
        }
        let _ = cmd_id;
        if let Some(handler) = group.handler {
            handler(forwarded);
        }
        true
    }

    /// Sweeps expired paths, synthesising timeouts, see `spec.md` section 4.4.
    /// Returns the IN-paths whose `expire_at` has passed (to be answered with
    /// a synthesised `CmdResult{status=Timeout}`), removing them from the
    /// table. OUT-paths are handled by the caller via [`PathTable::take_expired_out_paths`].
    pub fn take_expired_in_paths(&mut self, now: Instant) -> Vec<Path> {
        let expired: Vec<CmdId> = self
            .in_paths
            .iter()
            .filter(|(_, path)| path.expire_at.is_some_and(|t| t <= now))
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.in_paths.shift_remove(&id))
            .collect()
    }

    /// Returns (and removes) every OUT-path single entry whose timeout has
    /// elapsed, along with its handler, to be fired with a synthesised
    /// `Timeout` result.
    pub fn take_expired_out_paths(&mut self, now: Instant) -> Vec<(Path, ResultHandler)> {
        let expired: Vec<CmdId> = self
            .out_paths
            .iter()
            .filter_map(|(id, entry)| match entry {
                OutEntry::Single(single) if single.path.expire_at.is_some_and(|t| t <= now) => Some(*id),
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|id| match self.out_paths.shift_remove(&id)? {
                OutEntry::Single(single) => Some((single.path, single.handler)),
                OutEntry::Grouped(_) => None,
            })
            .collect()
    }

    pub fn in_path_count(&self) -> usize {
        self.in_paths.len()
    }

    pub fn out_path_count(&self) -> usize {
        self.out_paths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use ten_runtime_protocol::StatusCode;

    fn loc(name: &str) -> Loc {
        Loc::extension("g1", name)
    }

    fn ok_result(cmd_id: CmdId) -> Message {
        Message::new_cmd_result(StatusCode::Ok, "ping", cmd_id, true, loc("e2"))
    }

    #[test]
    fn single_out_path_resolves_and_removes() {
        let mut table = PathTable::new();
        let cmd_id = CmdId::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        table.add_out_path(cmd_id, "ping", loc("e1"), None, Box::new(move |_| called_clone.store(true, Ordering::SeqCst)));

        assert_eq!(table.out_path_count(), 1);
        let resolved = table.resolve_out_path(cmd_id, true, true, ok_result(cmd_id));
        assert!(resolved);
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(table.out_path_count(), 0);
    }

    #[test]
    fn group_return_last_waits_for_all_ok() {
        let mut table = PathTable::new();
        let a = CmdId::new();
        let b = CmdId::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        table.add_out_path_group(
            vec![a, b],
            "fan",
            loc("e1"),
            None,
            GroupPolicy::OneFailReturnAndAllOkReturnLast,
            Box::new(move |_| called_clone.store(true, Ordering::SeqCst)),
        );

        assert!(!table.resolve_out_path(a, true, true, ok_result(a)));
        assert!(!called.load(Ordering::SeqCst));
        assert!(table.resolve_out_path(b, true, true, ok_result(b)));
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(table.out_path_count(), 0);
    }

    #[test]
    fn group_return_last_propagates_immediately_on_failure() {
        let mut table = PathTable::new();
        let a = CmdId::new();
        let b = CmdId::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        table.add_out_path_group(
            vec![a, b],
            "fan",
            loc("e1"),
            None,
            GroupPolicy::OneFailReturnAndAllOkReturnLast,
            Box::new(move |_| called_clone.store(true, Ordering::SeqCst)),
        );

        let failed = Message::new_cmd_result(StatusCode::Error, "fan", a, true, loc("e2"));
        assert!(table.resolve_out_path(a, true, false, failed));
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(table.out_path_count(), 0);
    }

    #[test]
    fn expired_in_paths_are_swept() {
        let mut table = PathTable::new();
        let cmd_id = CmdId::new();
        table.add_in_path(cmd_id, "ping", loc("e1"), None, Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(1));
        let expired = table.take_expired_in_paths(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(table.in_path_count(), 0);
    }
}
