use std::cmp::Ordering;

use kestrel_common::types::Mtr;

/// Decide a push between an InProgress incumbent and a challenger.
///
/// Pure function of the two MTRs: higher priority wins; on a tie the older
/// transaction wins. TSO-issued timestamps are unique across transactions, so
/// full equality can only mean a transaction pushed itself — the incumbent is
/// kept. Determinism here is what makes the push protocol idempotent.
pub fn challenger_wins(incumbent: &Mtr, challenger: &Mtr) -> bool {
    match challenger.priority.cmp(&incumbent.priority) {
        // Lower numeric priority value is the higher priority.
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => challenger
            .timestamp
            .compare_certain(&incumbent.timestamp)
            .is_lt(),
    }
}
