//! Typed structural comparison of node, pod and container records

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::{ContainerInfo, NodeInfo, PodInfo};

/// One field that differs between two records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMismatch {
    /// Dotted path of the field, e.g. `running_containers.main.dev_requests`
    pub field: String,
    pub left: String,
    pub right: String,
}

fn compare<T: PartialEq + Debug>(
    out: &mut Vec<FieldMismatch>,
    field: String,
    left: &T,
    right: &T,
) {
    if left != right {
        out.push(FieldMismatch {
            field,
            left: format!("{:?}", left),
            right: format!("{:?}", right),
        });
    }
}

fn prefixed(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

/// Fields that differ between two node records
pub fn diff_node(left: &NodeInfo, right: &NodeInfo) -> Vec<FieldMismatch> {
    let mut out = Vec::new();
    compare(&mut out, "name".into(), &left.name, &right.name);
    compare(&mut out, "capacity".into(), &left.capacity, &right.capacity);
    compare(&mut out, "allocatable".into(), &left.allocatable, &right.allocatable);
    compare(&mut out, "used".into(), &left.used, &right.used);
    compare(&mut out, "scorer".into(), &left.scorer, &right.scorer);
    compare(&mut out, "kube_cap".into(), &left.kube_cap, &right.kube_cap);
    compare(&mut out, "kube_alloc".into(), &left.kube_alloc, &right.kube_alloc);
    out
}

/// Fields that differ between two container records
pub fn diff_container(left: &ContainerInfo, right: &ContainerInfo) -> Vec<FieldMismatch> {
    let mut out = Vec::new();
    diff_container_into(&mut out, "", left, right);
    out
}

fn diff_container_into(
    out: &mut Vec<FieldMismatch>,
    prefix: &str,
    left: &ContainerInfo,
    right: &ContainerInfo,
) {
    compare(out, prefixed(prefix, "requests"), &left.requests, &right.requests);
    compare(out, prefixed(prefix, "kube_requests"), &left.kube_requests, &right.kube_requests);
    compare(out, prefixed(prefix, "dev_requests"), &left.dev_requests, &right.dev_requests);
    compare(out, prefixed(prefix, "allocate_from"), &left.allocate_from, &right.allocate_from);
    compare(out, prefixed(prefix, "scorer"), &left.scorer, &right.scorer);
}

fn diff_containers(
    out: &mut Vec<FieldMismatch>,
    prefix: &str,
    left: &BTreeMap<String, ContainerInfo>,
    right: &BTreeMap<String, ContainerInfo>,
) {
    for (name, l) in left {
        let path = format!("{}.{}", prefix, name);
        match right.get(name) {
            Some(r) => diff_container_into(out, &path, l, r),
            None => out.push(FieldMismatch {
                field: path,
                left: "present".to_string(),
                right: "missing".to_string(),
            }),
        }
    }
    for name in right.keys().filter(|name| !left.contains_key(*name)) {
        out.push(FieldMismatch {
            field: format!("{}.{}", prefix, name),
            left: "missing".to_string(),
            right: "present".to_string(),
        });
    }
}

/// Fields that differ between two pod records, including every container
pub fn diff_pod(left: &PodInfo, right: &PodInfo) -> Vec<FieldMismatch> {
    let mut out = Vec::new();
    compare(&mut out, "name".into(), &left.name, &right.name);
    compare(&mut out, "node_name".into(), &left.node_name, &right.node_name);
    compare(&mut out, "requests".into(), &left.requests, &right.requests);
    diff_containers(&mut out, "init_containers", &left.init_containers, &right.init_containers);
    diff_containers(
        &mut out,
        "running_containers",
        &left.running_containers,
        &right.running_containers,
    );
    out
}
