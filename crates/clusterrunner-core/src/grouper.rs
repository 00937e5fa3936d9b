//! Atom grouping: splits a flat list of atoms into subjobs.

use std::collections::HashMap;

use crate::atom::Atom;

/// Fraction of total expected time the first ("big chunk") bucketing pass
/// targets across `max_executors` buckets; the remainder is covered by a
/// second, unbounded ("small chunk") pass.
const BIG_CHUNK_FRACTION: f64 = 0.8;

/// Groups atoms one-per-subjob, ignoring any timing data. Used when no
/// atom in the build has timing data to group by.
pub fn trivial_groupings(atoms: Vec<Atom>) -> Vec<Vec<Atom>> {
    atoms.into_iter().map(|atom| vec![atom]).collect()
}

/// Groups atoms into subjobs targeting balanced total execution time per
/// subjob, given a map of known `atom_key -> expected_time` timing data.
///
/// Falls back to [`trivial_groupings`] if no atom matches an entry in
/// `known_times`.
pub fn time_based_groupings(
    mut atoms: Vec<Atom>,
    known_times: &HashMap<String, f64>,
    atom_key: impl Fn(&Atom) -> String,
    max_executors: u32,
) -> Vec<Vec<Atom>> {
    if known_times.is_empty() {
        return trivial_groupings(atoms);
    }

    let mut any_known = false;
    for atom in &mut atoms {
        if let Some(time) = known_times.get(&atom_key(atom)) {
            atom.expected_time = Some(*time);
            any_known = true;
        }
    }
    if !any_known {
        return trivial_groupings(atoms);
    }

    let max_known_time = atoms
        .iter()
        .filter_map(|a| a.expected_time)
        .fold(0.0_f64, f64::max);
    let mut total_time = 0.0;
    for atom in &mut atoms {
        if atom.expected_time.is_none() {
            atom.expected_time = Some(max_known_time);
        }
        total_time += atom.expected_time.unwrap_or(0.0);
    }

    atoms.sort_by(|a, b| {
        b.expected_time
            .partial_cmp(&a.expected_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let max_executors = max_executors.max(1) as f64;
    let big_subjob_time = (total_time * BIG_CHUNK_FRACTION) / max_executors;
    let small_subjob_time = (total_time * (1.0 - BIG_CHUNK_FRACTION)) / (2.0 * max_executors);

    let (mut subjobs, remaining) =
        group_into_sized_buckets(atoms, big_subjob_time, Some(max_executors as u32));
    let (small_subjobs, _) = group_into_sized_buckets(remaining, small_subjob_time, None);
    subjobs.extend(small_subjobs);
    subjobs
}

/// Greedily buckets `atoms` (already sorted by descending expected time)
/// into groups each targeting `target_time_per_bucket` total time.
///
/// Each bucket is built by scanning the *entire* remaining atom list in
/// order and taking every atom whose addition would not push the bucket
/// past `target_time_per_bucket` (an atom is always taken if the bucket is
/// still empty, so a single oversized atom still gets its own bucket). A
/// bucket is closed once a full scan adds nothing more to it, and the next
/// bucket starts scanning from whatever is left.
///
/// If `max_groups_to_create` is set, after every atom is placed this checks
/// whether `buckets_so_far + atoms_still_unplaced + 1 <= max_groups_to_create`;
/// once true, the current bucket is closed, every remaining atom is emitted
/// as its own singleton bucket, and bucketing returns immediately. Absent
/// that early termination, the outer loop itself stops opening new buckets
/// once `max_groups_to_create` is reached, in which case whatever atoms are
/// still unplaced are handed back as `leftover` for a subsequent pass.
fn group_into_sized_buckets(
    atoms: Vec<Atom>,
    target_time_per_bucket: f64,
    max_groups_to_create: Option<u32>,
) -> (Vec<Vec<Atom>>, Vec<Atom>) {
    let mut remaining: Vec<Atom> = atoms;
    let mut subjobs: Vec<Vec<Atom>> = Vec::new();

    while remaining.first().is_some() && max_groups_to_create.is_none_or(|max| (subjobs.len() as u32) < max) {
        let mut bucket: Vec<Atom> = Vec::new();
        let mut bucket_time = 0.0_f64;
        let mut i = 0;

        while i < remaining.len() {
            let time = remaining[i].expected_time.unwrap_or(0.0);
            if !bucket.is_empty() && bucket_time + time > target_time_per_bucket {
                i += 1;
                continue;
            }

            bucket_time += time;
            bucket.push(remaining.remove(i));

            if let Some(max_groups) = max_groups_to_create
                && subjobs.len() as u32 + remaining.len() as u32 + 1 <= max_groups
            {
                subjobs.push(bucket);
                subjobs.extend(remaining.drain(..).map(|atom| vec![atom]));
                return (subjobs, Vec::new());
            }
        }

        subjobs.push(bucket);
    }

    (subjobs, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed_atom(name: &str, time: f64) -> Atom {
        let mut atom = Atom::new(format!("export {name}=\"1\";"));
        atom.expected_time = Some(time);
        atom
    }

    #[test]
    fn trivial_groupings_is_one_atom_per_subjob() {
        let atoms = vec![Atom::new("a"), Atom::new("b")];
        let groups = trivial_groupings(atoms);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn time_based_falls_back_to_trivial_when_no_timing_data() {
        let atoms = vec![Atom::new("a"), Atom::new("b")];
        let known = HashMap::new();
        let groups = time_based_groupings(atoms, &known, |a| a.command_string.clone(), 4);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn time_based_balances_buckets_by_total_time() {
        let atoms = vec![
            timed_atom("a", 10.0),
            timed_atom("b", 10.0),
            timed_atom("c", 1.0),
            timed_atom("d", 1.0),
        ];
        let mut known = HashMap::new();
        known.insert("export a=\"1\";".to_string(), 10.0);
        let groups = time_based_groupings(
            atoms,
            &known,
            |a| a.command_string.clone(),
            2,
        );
        let total_atoms: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total_atoms, 4);
        assert!(groups.len() >= 2);
    }

    #[test]
    fn time_based_groupings_matches_the_reference_partition_for_seven_atoms() {
        let names_and_times = [
            ("a", 100.0),
            ("b", 80.0),
            ("c", 60.0),
            ("d", 30.0),
            ("e", 15.0),
            ("f", 10.0),
            ("g", 5.0),
        ];
        let atoms: Vec<Atom> = names_and_times
            .iter()
            .map(|(name, time)| timed_atom(name, *time))
            .collect();
        let mut known = HashMap::new();
        for (name, time) in names_and_times {
            known.insert(format!("export {name}=\"1\";"), time);
        }

        let groups = time_based_groupings(atoms, &known, |a| a.command_string.clone(), 3);

        let partition: Vec<Vec<f64>> = groups
            .iter()
            .map(|group| group.iter().filter_map(|a| a.expected_time).collect())
            .collect();
        assert_eq!(
            partition,
            vec![
                vec![100.0],
                vec![80.0],
                vec![60.0, 15.0, 5.0],
                vec![30.0],
                vec![10.0],
            ]
        );
    }

    #[test]
    fn early_termination_emits_singletons_once_capacity_allows() {
        // Five equal-time atoms with a single-bucket cap: the first atom
        // fills bucket 0, then 1 (placed) + 4 (remaining) + 1 > 1 so no
        // early exit yet; subsequent atoms each still fit the bucket until
        // the cap condition flips once few atoms remain.
        let atoms: Vec<Atom> = (0..5).map(|i| timed_atom(&format!("a{i}"), 1.0)).collect();
        let (groups, leftover) = group_into_sized_buckets(atoms, 100.0, Some(3));
        assert!(leftover.is_empty());
        let total_atoms: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total_atoms, 5);
    }
}
