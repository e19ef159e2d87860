//! Incremental merge: decide which candidates need enrichment, then fold the
//! enriched work set back into the previous store.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use eotrack_core::{parse_action_date, Record, RecordStore};
use serde::Serialize;

const MISMATCH_SAMPLE: usize = 3;

pub fn normalize_identifier(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

pub fn identifier_set(store: &RecordStore, id_field: &str) -> BTreeSet<String> {
    if !store.has_column(id_field) {
        return BTreeSet::new();
    }
    store
        .records()
        .iter()
        .map(|record| normalize_identifier(record.get(id_field)))
        .collect()
}

/// New identifiers were found but no candidate record was selected for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeMismatch {
    pub new_ids: usize,
    pub matched: usize,
    pub sample: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkPlan {
    pub work: RecordStore,
    pub candidate_ids: usize,
    pub previous_ids: usize,
    pub new_ids: BTreeSet<String>,
    pub forced: bool,
    pub mismatch: Option<MergeMismatch>,
}

pub fn plan_work_set(
    previous: &RecordStore,
    candidate: &RecordStore,
    id_field: &str,
    force: bool,
) -> WorkPlan {
    let candidate_set = identifier_set(candidate, id_field);
    let previous_set = identifier_set(previous, id_field);
    let new_ids: BTreeSet<String> = candidate_set.difference(&previous_set).cloned().collect();

    let compare = !force && !previous.is_empty() && previous.has_column(id_field);
    let records: Vec<Record> = if compare {
        candidate
            .records()
            .iter()
            .filter(|record| !previous_set.contains(&normalize_identifier(record.get(id_field))))
            .cloned()
            .collect()
    } else {
        candidate.records().to_vec()
    };

    let mismatch = if compare {
        detect_mismatch(&new_ids, records.len())
    } else {
        None
    };

    WorkPlan {
        work: RecordStore::with_records(candidate.columns().iter().cloned(), records),
        candidate_ids: candidate_set.len(),
        previous_ids: previous_set.len(),
        new_ids,
        forced: force,
        mismatch,
    }
}

pub fn detect_mismatch(new_ids: &BTreeSet<String>, matched: usize) -> Option<MergeMismatch> {
    if new_ids.is_empty() || matched > 0 {
        return None;
    }
    Some(MergeMismatch {
        new_ids: new_ids.len(),
        matched,
        sample: new_ids.iter().take(MISMATCH_SAMPLE).cloned().collect(),
    })
}

/// Give both stores the union of their columns. New columns are null-filled.
pub fn reconcile_columns(a: &mut RecordStore, b: &mut RecordStore) {
    let only_b: Vec<String> = b
        .columns()
        .iter()
        .filter(|c| !a.has_column(c))
        .cloned()
        .collect();
    let only_a: Vec<String> = a
        .columns()
        .iter()
        .filter(|c| !b.has_column(c))
        .cloned()
        .collect();
    for column in &only_b {
        a.fill_column(column, None);
    }
    for column in &only_a {
        b.fill_column(column, None);
    }
}

pub fn combine(
    previous: Option<RecordStore>,
    enriched: RecordStore,
    id_field: &str,
    date_field: &str,
) -> RecordStore {
    let (columns, records) = match previous {
        Some(mut previous) => {
            let mut enriched = enriched;
            reconcile_columns(&mut previous, &mut enriched);
            let columns = previous.columns().to_vec();
            let mut records = previous.into_records();
            records.extend(enriched.into_records());
            (columns, records)
        }
        None => (enriched.columns().to_vec(), enriched.into_records()),
    };

    let keyed = columns.iter().any(|c| c == id_field);
    let mut records = if keyed {
        dedup_keep_last(records, id_field)
    } else {
        records
    };
    sort_by_date_desc(&mut records, date_field);
    RecordStore::with_records(columns, records)
}

/// Later occurrences win unless an earlier one carries strictly more enrichment.
fn dedup_keep_last(records: Vec<Record>, id_field: &str) -> Vec<Record> {
    let mut winners: HashMap<String, (usize, Record)> = HashMap::with_capacity(records.len());
    for (position, record) in records.into_iter().enumerate() {
        let id = normalize_identifier(record.get(id_field));
        match winners.get_mut(&id) {
            Some((last_position, kept)) => {
                *last_position = position;
                if record.enrichment_rank() >= kept.enrichment_rank() {
                    *kept = record;
                }
            }
            None => {
                winners.insert(id, (position, record));
            }
        }
    }
    let mut survivors: Vec<(usize, Record)> = winners.into_values().collect();
    survivors.sort_by_key(|(position, _)| *position);
    survivors.into_iter().map(|(_, record)| record).collect()
}

/// Newest first; missing or unparsable dates sink to the end in their original order.
pub fn sort_by_date_desc(records: &mut [Record], date_field: &str) {
    records.sort_by_cached_key(|record| {
        let date = record.get(date_field).and_then(parse_action_date);
        (date.is_none(), Reverse(date))
    });
}

pub fn missing_after_merge(candidate: &RecordStore, result: &RecordStore, id_field: &str) -> Vec<String> {
    let present = identifier_set(result, id_field);
    identifier_set(candidate, id_field)
        .into_iter()
        .filter(|id| !present.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eotrack_core::{COL_CONTENT, COL_DATE, COL_LINK, COL_SUMMARY, COL_TITLE, SUMMARY_FAILED};

    fn record(link: &str, date: &str) -> Record {
        Record::new(format!("Title {link}"), link, date)
    }

    fn store(records: Vec<Record>) -> RecordStore {
        RecordStore::with_records([COL_TITLE, COL_LINK, COL_DATE, COL_CONTENT], records)
    }

    fn links(store: &RecordStore) -> Vec<String> {
        store
            .records()
            .iter()
            .map(|r| r.link.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn identifiers_are_trimmed_and_null_is_empty() {
        assert_eq!(normalize_identifier(Some("  abc \n")), "abc");
        assert_eq!(normalize_identifier(None), "");
    }

    #[test]
    fn only_unseen_candidates_are_planned() {
        let previous = store(vec![record("a", "01/01/2025")]);
        let candidate = store(vec![record("a", "01/01/2025"), record("b", "01/02/2025")]);
        let plan = plan_work_set(&previous, &candidate, COL_LINK, false);
        assert_eq!(links(&plan.work), vec!["b"]);
        assert_eq!(plan.candidate_ids, 2);
        assert_eq!(plan.previous_ids, 1);
        assert_eq!(plan.new_ids.len(), 1);
        assert!(plan.mismatch.is_none());
    }

    #[test]
    fn whitespace_variants_match_existing_ids() {
        let previous = store(vec![record(" a ", "01/01/2025")]);
        let candidate = store(vec![record("a", "01/01/2025")]);
        let plan = plan_work_set(&previous, &candidate, COL_LINK, false);
        assert!(plan.work.is_empty());
    }

    #[test]
    fn force_replans_everything() {
        let previous = store(vec![record("a", "01/01/2025")]);
        let candidate = store(vec![record("a", "01/01/2025")]);
        let plan = plan_work_set(&previous, &candidate, COL_LINK, true);
        assert_eq!(links(&plan.work), vec!["a"]);
        assert!(plan.forced);
    }

    #[test]
    fn empty_or_unkeyed_previous_plans_all_candidates() {
        let candidate = store(vec![record("a", "01/01/2025"), record("b", "01/02/2025")]);
        let empty = RecordStore::new([COL_TITLE, COL_LINK]);
        assert_eq!(plan_work_set(&empty, &candidate, COL_LINK, false).work.len(), 2);

        let unkeyed = RecordStore::with_records([COL_TITLE], vec![record("a", "01/01/2025")]);
        assert_eq!(plan_work_set(&unkeyed, &candidate, COL_LINK, false).work.len(), 2);
    }

    #[test]
    fn mismatch_reports_counts_and_small_sample() {
        let ids: BTreeSet<String> = ["d", "a", "c", "b"].iter().map(|s| s.to_string()).collect();
        let mismatch = detect_mismatch(&ids, 0).expect("mismatch");
        assert_eq!(mismatch.new_ids, 4);
        assert_eq!(mismatch.matched, 0);
        assert_eq!(mismatch.sample, vec!["a", "b", "c"]);
        assert!(detect_mismatch(&ids, 1).is_none());
        assert!(detect_mismatch(&BTreeSet::new(), 0).is_none());
    }

    #[test]
    fn reconcile_adds_missing_columns_as_null() {
        let mut left = RecordStore::with_records(["a", "b"], vec![{
            let mut r = Record::default();
            r.set("a", Some("1".into()));
            r.set("b", Some("2".into()));
            r
        }]);
        let mut right = RecordStore::with_records(["b", "c"], vec![{
            let mut r = Record::default();
            r.set("b", Some("3".into()));
            r.set("c", Some("4".into()));
            r
        }]);
        reconcile_columns(&mut left, &mut right);
        assert_eq!(left.columns(), ["a", "b", "c"]);
        assert_eq!(right.columns(), ["b", "c", "a"]);
        assert_eq!(left.records()[0].get("c"), None);
        assert_eq!(right.records()[0].get("a"), None);
        assert_eq!(right.records()[0].get("c"), Some("4"));
    }

    #[test]
    fn combine_prefers_enriched_duplicate() {
        let mut stale = record("x", "01/01/2025");
        stale.summary = None;
        let previous = RecordStore::with_records([COL_LINK, COL_DATE, COL_SUMMARY], vec![stale]);

        let mut fresh = record("x", "01/01/2025");
        fresh.summary = Some("S".into());
        let work = RecordStore::with_records([COL_LINK, COL_DATE, COL_SUMMARY], vec![fresh]);

        let merged = combine(Some(previous), work, COL_LINK, COL_DATE);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records()[0].summary.as_deref(), Some("S"));
    }

    #[test]
    fn combine_keeps_earlier_record_when_later_is_only_a_sentinel() {
        let mut good = record("x", "01/01/2025");
        good.content = Some("Body".into());
        good.summary = Some("Real summary".into());
        let previous = RecordStore::with_records([COL_LINK, COL_DATE, COL_CONTENT, COL_SUMMARY], vec![good]);

        let mut failed = record("x", "01/01/2025");
        failed.content = Some("Body".into());
        failed.summary = Some(SUMMARY_FAILED.into());
        let work = RecordStore::with_records([COL_LINK, COL_DATE, COL_CONTENT, COL_SUMMARY], vec![failed]);

        let merged = combine(Some(previous), work, COL_LINK, COL_DATE);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records()[0].summary.as_deref(), Some("Real summary"));
    }

    #[test]
    fn combine_sorts_newest_first_with_unparsable_dates_last() {
        let previous = store(vec![
            record("old", "01/05/2025"),
            record("junk", "No date"),
            record("newest", "March 03, 2025"),
        ]);
        let work = store(vec![record("mid", "2025-02-01"), record("blank", "")]);
        let merged = combine(Some(previous), work, COL_LINK, COL_DATE);
        assert_eq!(links(&merged), vec!["newest", "mid", "old", "junk", "blank"]);
    }

    #[test]
    fn combine_without_previous_still_dedups() {
        let work = store(vec![record("a", "01/01/2025"), record("a", "01/01/2025")]);
        let merged = combine(None, work, COL_LINK, COL_DATE);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_is_idempotent() {
        let previous = store(vec![record("a", "01/01/2025"), record("b", "01/03/2025")]);
        let candidate = store(vec![
            record("b", "01/03/2025"),
            record("c", "01/04/2025"),
        ]);

        let first_plan = plan_work_set(&previous, &candidate, COL_LINK, false);
        let first = combine(Some(previous.clone()), first_plan.work, COL_LINK, COL_DATE);

        let second_plan = plan_work_set(&first, &candidate, COL_LINK, false);
        assert!(second_plan.work.is_empty());
        let second = combine(Some(first.clone()), second_plan.work, COL_LINK, COL_DATE);

        assert_eq!(first, second);
        assert_eq!(links(&second), vec!["c", "b", "a"]);
    }

    #[test]
    fn missing_after_merge_lists_absent_candidates() {
        let candidate = store(vec![record("a", "01/01/2025"), record("b", "01/02/2025")]);
        let result = store(vec![record("a", "01/01/2025")]);
        assert_eq!(missing_after_merge(&candidate, &result, COL_LINK), vec!["b"]);
    }
}
