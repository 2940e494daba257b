// Copyright 2024 The Viewtree Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interleaved list positions.
//!
//! Given a collection in its requested final order, with the pre-existing
//! position of every element that already had one, produce a strictly
//! increasing position sequence that reuses as many existing positions as
//! possible: a longest strictly-increasing subsequence keeps its values,
//! everything else is interpolated between its kept neighbors. This keeps
//! churn minimal; an element that did not move usually keeps its row
//! untouched.

/// Positions for the final order. `existing[i]` is element i's current
/// position, or `None` for a fresh element.
pub fn interleaved_positions(existing: &[Option<f64>]) -> Vec<f64> {
    let kept = longest_increasing_run(existing);
    let mut result = vec![0.0; existing.len()];
    for &index in &kept {
        result[index] = existing[index].unwrap();
    }

    let mut cursor = 0;
    let mut previous: Option<(usize, f64)> = None;
    for &kept_index in kept.iter().chain(std::iter::once(&existing.len())) {
        let upper = (kept_index < existing.len()).then(|| result[kept_index]);
        let run: Vec<usize> = (cursor..kept_index).collect();
        if !run.is_empty() {
            fill_run(&mut result, &run, previous.map(|(_, v)| v), upper);
        }
        if kept_index < existing.len() {
            previous = Some((kept_index, result[kept_index]));
        }
        cursor = kept_index + 1;
    }

    // Float interpolation can run out of room between near-equal bounds; a
    // full renumber keeps the strict-monotonicity guarantee.
    if result.windows(2).any(|pair| pair[0] >= pair[1]) {
        return (1..=existing.len()).map(|n| n as f64).collect();
    }
    result
}

/// Indices of a longest strictly-increasing subsequence of the known
/// positions, by patience sorting.
fn longest_increasing_run(existing: &[Option<f64>]) -> Vec<usize> {
    // tails[k] = index of the smallest known tail of an increasing run of
    // length k + 1.
    let mut tails: Vec<usize> = Vec::new();
    let mut parents: Vec<Option<usize>> = vec![None; existing.len()];
    for (index, value) in existing.iter().enumerate() {
        let Some(value) = value else {
            continue;
        };
        let at = tails.partition_point(|&tail| existing[tail].unwrap() < *value);
        parents[index] = at.checked_sub(1).map(|k| tails[k]);
        if at == tails.len() {
            tails.push(index);
        } else {
            tails[at] = index;
        }
    }
    let mut run = Vec::with_capacity(tails.len());
    let mut next = tails.last().copied();
    while let Some(index) = next {
        run.push(index);
        next = parents[index];
    }
    run.reverse();
    run
}

/// Assigns fresh positions to a run of elements bounded by the kept
/// positions `lower` and `upper` (either may be open).
fn fill_run(result: &mut [f64], run: &[usize], lower: Option<f64>, upper: Option<f64>) {
    let n = run.len() as f64;
    match (lower, upper) {
        (Some(lower), Some(upper)) => {
            let step = (upper - lower) / (n + 1.0);
            for (offset, &index) in run.iter().enumerate() {
                result[index] = lower + step * (offset as f64 + 1.0);
            }
        }
        (Some(lower), None) => {
            for (offset, &index) in run.iter().enumerate() {
                result[index] = lower + offset as f64 + 1.0;
            }
        }
        (None, Some(upper)) => {
            for (offset, &index) in run.iter().enumerate() {
                result[index] = upper - n + offset as f64;
            }
        }
        (None, None) => {
            for (offset, &index) in run.iter().enumerate() {
                result[index] = offset as f64 + 1.0;
            }
        }
    }
}
