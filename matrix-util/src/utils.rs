use fnv::FnvHashMap as HashMap;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., cluster assignment)
/// # Returns
/// A hashmap: cluster/group name -> indexes of the elements (ascending)
pub fn partition_by_membership<T>(membership: &[T]) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
{
    let mut pb_elems: HashMap<T, Vec<usize>> = HashMap::default();
    for (i, k) in membership.iter().enumerate() {
        pb_elems.entry(k.clone()).or_default().push(i);
    }
    pb_elems
}

/// Render a horizontal bar chart, one line per `(label, value)`,
/// scaled to `max_width` characters for the largest value
pub fn bar_chart_ascii(title: &str, items: &[(Box<str>, f32)], max_width: usize) -> String {
    let vmax = items
        .iter()
        .map(|(_, v)| *v)
        .filter(|v| v.is_finite())
        .fold(0_f32, f32::max);

    let mut lines = vec![title.to_string(), String::new()];
    for (label, v) in items {
        let bar_len = if vmax > 0.0 && v.is_finite() && *v > 0.0 {
            ((v / vmax) * max_width as f32).round() as usize
        } else {
            0
        };
        lines.push(format!(
            "  {:>10}  {:>10.4}  {}",
            label,
            v,
            "█".repeat(bar_len.max(1))
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_membership() {
        let groups = partition_by_membership(&[1, 0, 1, 2]);
        assert_eq!(groups[&1], vec![0, 2]);
        assert_eq!(groups[&0], vec![1]);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_bar_chart() {
        let chart = bar_chart_ascii("t", &[("a".into(), 1.0), ("b".into(), 2.0)], 10);
        assert!(chart.contains("██████████"));
        assert_eq!(chart.lines().count(), 4);
    }
}
