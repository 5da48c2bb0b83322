//! Overall job status derived from the per-platform slices.

use super::types::{BuildJob, BuildStatus};

/// Derive a job's overall status.
///
/// Precedence: any FAILED, then any IN_PROGRESS, then all SUCCESS.
/// Anything else (including no platforms at all) is PENDING.
pub fn derive_overall<I>(statuses: I) -> BuildStatus
where
    I: IntoIterator<Item = BuildStatus>,
{
    let mut seen_any = false;
    let mut in_progress = false;
    let mut all_success = true;
    for status in statuses {
        seen_any = true;
        match status {
            BuildStatus::Failed => return BuildStatus::Failed,
            BuildStatus::InProgress => {
                in_progress = true;
                all_success = false;
            }
            BuildStatus::Pending => all_success = false,
            BuildStatus::Success => {}
        }
    }
    if in_progress {
        BuildStatus::InProgress
    } else if seen_any && all_success {
        BuildStatus::Success
    } else {
        BuildStatus::Pending
    }
}

/// Recompute `job.status` from its platform states.
pub fn refresh(job: &mut BuildJob) {
    job.status = derive_overall(job.platform_states.values().map(|s| s.status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use BuildStatus::*;

    fn permutations(items: &[BuildStatus]) -> Vec<Vec<BuildStatus>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn precedence() {
        assert_eq!(derive_overall([Success, Failed, InProgress]), Failed);
        assert_eq!(derive_overall([Success, InProgress, Pending]), InProgress);
        assert_eq!(derive_overall([Success, Success]), Success);
        assert_eq!(derive_overall([Success, Pending]), Pending);
        assert_eq!(derive_overall([Pending, Pending]), Pending);
    }

    #[test]
    fn empty_is_pending() {
        assert_eq!(derive_overall(Vec::new()), Pending);
    }

    #[test]
    fn order_does_not_matter() {
        let sets: [&[BuildStatus]; 4] = [
            &[Success, Failed, Pending, InProgress],
            &[Success, Success, Pending],
            &[InProgress, Pending, Success],
            &[Success, Success, Success],
        ];
        for set in sets {
            let expected = derive_overall(set.iter().copied());
            for perm in permutations(set) {
                assert_eq!(derive_overall(perm.clone()), expected, "{perm:?}");
            }
        }
    }
}
