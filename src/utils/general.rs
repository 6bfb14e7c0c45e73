use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::hash::Hash;

//////////////////
// VECTOR STUFF //
//////////////////

/// Get the maximum value of an array
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// The maximum value found in the array
pub fn array_max<T: PartialOrd + Copy>(arr: &[T]) -> T {
    let mut max_val = arr[0];
    for number in arr {
        if *number > max_val {
            max_val = *number
        }
    }
    max_val
}

/// Get the minimum value of an array
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// The minimum value found in the array
pub fn array_min<T: PartialOrd + Copy>(arr: &[T]) -> T {
    let mut min_val = arr[0];
    for number in arr {
        if *number < min_val {
            min_val = *number
        }
    }
    min_val
}

/// Get the unique elements of a slice, keeping the order of first occurrence
///
/// ### Params
///
/// * `vec` - The slice of hashable values.
///
/// ### Returns
///
/// The unique elements of `vec` as a Vec.
pub fn unique<T>(vec: &[T]) -> Vec<T>
where
    T: Clone + Eq + Hash,
{
    let mut set = FxHashSet::with_capacity_and_hasher(vec.len(), FxBuildHasher);
    vec.iter()
        .filter(|item| set.insert(*item))
        .cloned()
        .collect()
}

/// Find the first duplicated element of a slice
///
/// ### Params
///
/// * `vec` - The slice to check
///
/// ### Returns
///
/// The first element that was seen before, if any
pub fn first_duplicate<T>(vec: &[T]) -> Option<&T>
where
    T: Eq + Hash,
{
    let mut set = FxHashSet::with_capacity_and_hasher(vec.len(), FxBuildHasher);
    vec.iter().find(|item| !set.insert(*item))
}

/// Build a lookup from element to its index position
///
/// ### Params
///
/// * `x` - The string slice
///
/// ### Returns
///
/// HashMap with borrowed keys pointing to the index positions
pub fn index_map(x: &[String]) -> FxHashMap<&str, usize> {
    let mut map = FxHashMap::with_capacity_and_hasher(x.len(), FxBuildHasher);
    for (i, s) in x.iter().enumerate() {
        map.entry(s.as_str()).or_insert(i);
    }
    map
}

/// Descending comparison that sorts NaNs to the end
#[inline]
pub fn cmp_desc_nan_last(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a)
        .unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

/// Returns the indices that sort the slice in descending order
///
/// The sort is stable: equal values keep their input order. NaNs are
/// placed at the end.
///
/// ### Params
///
/// * `x` - Input slice to get ordering for
///
/// ### Returns
///
/// Vector of sorting indices
pub fn argsort_desc(x: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&i, &j| cmp_desc_nan_last(x[i], x[j]));
    order
}

/// Convert order indices to ranks
///
/// ### Params
///
/// * `order` - Ordering indices, i.e., `order[rank] = original index`
///
/// ### Returns
///
/// Rank vector, i.e., `ranks[original index] = rank`
pub fn ranks_from_order(order: &[usize]) -> Vec<usize> {
    let mut res = vec![0; order.len()];
    for (rank, &idx) in order.iter().enumerate() {
        res[idx] = rank;
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argsort_desc_stable() {
        let x = [1.0, 3.0, 1.0, 5.0, 3.0];
        assert_eq!(argsort_desc(&x), vec![3, 1, 4, 0, 2]);
    }

    #[test]
    fn test_argsort_desc_nan_last() {
        let x = [f64::NAN, -1.0, 2.0];
        assert_eq!(argsort_desc(&x), vec![2, 1, 0]);
    }

    #[test]
    fn test_ranks_from_order() {
        let order = vec![2, 0, 1];
        assert_eq!(ranks_from_order(&order), vec![1, 2, 0]);
    }

    #[test]
    fn test_unique_and_duplicates() {
        let v = vec!["a", "b", "a", "c", "b"];
        assert_eq!(unique(&v), vec!["a", "b", "c"]);
        assert_eq!(first_duplicate(&v), Some(&"a"));
        assert_eq!(first_duplicate(&["x", "y"]), None);
    }
}
