use std::cmp::Ordering;

use crate::core::model::FileSummary;

/// What a group's members have in common, which decides the rules that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTraits {
    pub byte_identical: bool,
    pub images: bool,
}

/// Orders two members by keep preference; `Less` means `a` should be kept
/// over `b`. Rules run in order and the first one that discriminates wins:
///
/// 1. byte-identical groups: smallest `name`
/// 2. image groups: higher resolution
/// 3. more recent `modified_at` (a missing timestamp loses)
/// 4. larger `size_bytes`
/// 5. smallest `id`
///
/// Ids are unique within a batch, so the order is total.
pub fn keep_preference(a: &FileSummary, b: &FileSummary, traits: GroupTraits) -> Ordering {
    let by_name = if traits.byte_identical {
        a.name.cmp(&b.name)
    } else {
        Ordering::Equal
    };

    by_name
        .then_with(|| {
            if traits.images {
                let pixels = |f: &FileSummary| f.dimensions.map(|d| d.pixels()).unwrap_or(0);
                pixels(b).cmp(&pixels(a))
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| b.modified_at.cmp(&a.modified_at))
        .then_with(|| b.size_bytes.cmp(&a.size_bytes))
        .then_with(|| a.id.cmp(&b.id))
}

/// Index of the member to keep. `members` must not be empty.
pub fn select_kept(members: &[FileSummary], traits: GroupTraits) -> usize {
    members
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| keep_preference(a, b, traits))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
