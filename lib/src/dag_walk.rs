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

//! General-purpose graph algorithms.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::hash::Hash;
use std::iter;

/// Traverses nodes from `start` in depth-first order.
pub fn dfs<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> impl Iterator<Item = T>
where
    ID: Hash + Eq,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    let neighbors_fn = move |node: &T| to_ok_iter(neighbors_fn(node));
    dfs_ok(to_ok_iter(start), id_fn, neighbors_fn).map(Result::unwrap)
}

/// Traverses nodes from `start` in depth-first order.
///
/// An `Err` is emitted as a node with no neighbors. Caller may decide to
/// short-circuit on it.
pub fn dfs_ok<T, ID, E, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> impl Iterator<Item = Result<T, E>>
where
    ID: Hash + Eq,
    II: IntoIterator<Item = Result<T, E>>,
    NI: IntoIterator<Item = Result<T, E>>,
{
    let mut work: Vec<Result<T, E>> = start.into_iter().collect();
    let mut visited: HashSet<ID> = HashSet::new();
    iter::from_fn(move || loop {
        let c = match work.pop() {
            Some(Ok(c)) => c,
            r @ (Some(Err(_)) | None) => return r,
        };
        let id = id_fn(&c);
        if visited.contains(&id) {
            continue;
        }
        for p in neighbors_fn(&c) {
            work.push(p);
        }
        visited.insert(id);
        return Some(Ok(c));
    })
}

/// Finds a shortest path from `start` to `goal` counting every edge as one
/// step, and returns the node sequence including both endpoints.
///
/// Ties are broken by the order in which `neighbors_fn` yields neighbors.
pub fn shortest_path<T, ID, NI>(
    start: T,
    goal_fn: impl Fn(&T) -> bool,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> Option<Vec<T>>
where
    T: Clone,
    ID: Hash + Eq + Clone,
    NI: IntoIterator<Item = T>,
{
    let mut predecessors: HashMap<ID, T> = HashMap::new();
    let mut visited: HashSet<ID> = HashSet::new();
    let mut queue: VecDeque<T> = VecDeque::new();
    visited.insert(id_fn(&start));
    queue.push_back(start);
    while let Some(node) = queue.pop_front() {
        if goal_fn(&node) {
            let mut path = vec![node];
            while let Some(prev) = predecessors.get(&id_fn(path.last().unwrap())) {
                path.push(prev.clone());
            }
            path.reverse();
            return Some(path);
        }
        for neighbor in neighbors_fn(&node) {
            if visited.insert(id_fn(&neighbor)) {
                predecessors.insert(id_fn(&neighbor), node.clone());
                queue.push_back(neighbor);
            }
        }
    }
    None
}

fn to_ok_iter<T>(iter: impl IntoIterator<Item = T>) -> impl Iterator<Item = Result<T, Infallible>> {
    iter.into_iter().map(Ok)
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use maplit::hashmap;

    use super::*;

    #[test]
    fn test_dfs_ok() {
        let neighbors = hashmap! {
            'A' => vec![],
            'B' => vec![Ok('A'), Err('X')],
            'C' => vec![Ok('B')],
        };
        let id_fn = |node: &char| *node;
        let neighbors_fn = |node: &char| neighbors[node].clone();

        // Self and neighbor nodes shouldn't be lost at the error.
        let nodes = dfs_ok([Ok('C')], id_fn, neighbors_fn).collect_vec();
        assert_eq!(nodes, [Ok('C'), Ok('B'), Err('X'), Ok('A')]);
    }

    #[test]
    fn test_dfs_visits_each_node_once() {
        // This graph:
        //  D -> B -> A
        //  D -> C -> A
        let neighbors = hashmap! {
            'A' => vec![],
            'B' => vec!['A'],
            'C' => vec!['A'],
            'D' => vec!['C', 'B'],
        };
        let id_fn = |node: &char| *node;
        let neighbors_fn = |node: &char| neighbors[node].clone();

        let nodes = dfs(vec!['D'], id_fn, neighbors_fn).collect_vec();
        assert_eq!(nodes, vec!['D', 'B', 'A', 'C']);
    }

    #[test]
    fn test_shortest_path_linear() {
        let neighbors = hashmap! {
            1 => vec![2],
            2 => vec![3],
            3 => vec![],
        };
        let path = shortest_path(1, |n| *n == 3, |n| *n, |n| neighbors[n].clone());
        assert_eq!(path, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_shortest_path_prefers_fewer_edges() {
        // Both 1->4 and 1->2->3->4 reach the goal; the direct edge wins.
        let neighbors = hashmap! {
            1 => vec![2, 4],
            2 => vec![3],
            3 => vec![4],
            4 => vec![],
        };
        let path = shortest_path(1, |n| *n == 4, |n| *n, |n| neighbors[n].clone());
        assert_eq!(path, Some(vec![1, 4]));
    }

    #[test]
    fn test_shortest_path_unreachable() {
        let neighbors = hashmap! {
            1 => vec![2],
            2 => vec![],
            3 => vec![],
        };
        let path = shortest_path(1, |n| *n == 3, |n| *n, |n| neighbors[n].clone());
        assert_eq!(path, None);
    }

    #[test]
    fn test_shortest_path_start_is_goal() {
        let path = shortest_path(7, |n| *n == 7, |n| *n, |_: &i32| Vec::<i32>::new());
        assert_eq!(path, Some(vec![7]));
    }

    #[test]
    fn test_shortest_path_cyclic() {
        // Cycles must not prevent termination.
        let neighbors = hashmap! {
            1 => vec![2],
            2 => vec![1, 3],
            3 => vec![],
        };
        let path = shortest_path(1, |n| *n == 3, |n| *n, |n| neighbors[n].clone());
        assert_eq!(path, Some(vec![1, 2, 3]));
    }
}
