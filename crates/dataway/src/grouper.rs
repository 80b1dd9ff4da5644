//! 🧺 Point grouper — sorts points into buckets keyed by the tags the upstream routes on.
//!
//! A group key is a comma-joined list of `key=value` pairs:
//! 1. every global tag key, ascending, with the point's own value when it has the tag
//!    and the global value otherwise;
//! 2. every customer tag key, in configured order, with the point's value, or the
//!    category's synthetic tag (`source`/`measurement`/`class` = measurement name)
//!    when the key matches it. Keys the point cannot answer are left out.
//!
//! The empty key is legit: it is where tag-less points land.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::category::Category;
use crate::metrics::Metrics;
use crate::point::Point;

/// 🔑 The group key for one point.
pub fn group_key(
    pt: &Point,
    cat: Category,
    global_tags: &BTreeMap<String, String>,
    customer_keys: &[String],
) -> String {
    let mut pairs: Vec<String> = Vec::with_capacity(global_tags.len() + customer_keys.len());

    for (k, global_value) in global_tags {
        let v = pt.get_tag(k).unwrap_or(global_value);
        pairs.push(format!("{k}={v}"));
    }

    let synthetic = cat.policy().synthetic_tag.key();
    for k in customer_keys {
        if global_tags.contains_key(k) {
            continue;
        }
        if let Some(v) = pt.get_tag(k) {
            pairs.push(format!("{k}={v}"));
        } else if synthetic == Some(k.as_str()) {
            pairs.push(format!("{k}={}", pt.name()));
        }
    }

    pairs.join(",")
}

/// 🧺 Partitions `points` by group key. With no global tags and no customer keys
/// this is a no-op that returns everything under `""`.
pub fn group_points(
    points: Vec<Point>,
    cat: Category,
    global_tags: &BTreeMap<String, String>,
    customer_keys: &[String],
    metrics: Option<&Metrics>,
) -> HashMap<String, Vec<Point>> {
    let mut groups: HashMap<String, Vec<Point>> = HashMap::new();

    if global_tags.is_empty() && customer_keys.is_empty() {
        groups.insert(String::new(), points);
    } else {
        for pt in points {
            let key = group_key(&pt, cat, global_tags, customer_keys);
            groups.entry(key).or_default().push(pt);
        }
    }

    trace!("🧺 grouped {} category into {} buckets", cat, groups.len());
    if let Some(m) = metrics {
        m.group_count.with_label_values(&[cat.name()]).observe(groups.len() as f64);
    }
    groups
}
