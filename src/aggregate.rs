//! Grouping of enriched merge requests by work item, with derived counts
//! and two independent filtering passes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::assoc::EnrichedMergeRequest;
use crate::config::Thresholds;
use crate::remote::{WorkItem, WorkItemState};

/// One work item plus every enriched merge request referencing it.
/// Rebuilt on every aggregation pass; never cached on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketGroup {
  pub work_item: WorkItem,
  pub merge_requests: Vec<EnrichedMergeRequest>,
  pub total: usize,
  pub open: usize,
  /// Members whose age since creation exceeds the overdue threshold.
  pub overdue: usize,
  /// Members whose age since last update exceeds the stalled threshold.
  pub stalled: usize,
}

/// Attribute filters applied to a group's work item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupCriteria {
  pub state: Option<WorkItemState>,
  pub priority: Option<String>,
  pub item_type: Option<String>,
  pub assignee: Option<String>,
  /// Case-insensitive free text matched against the work item title and key.
  pub search: Option<String>,
}

impl GroupCriteria {
  fn matches(&self, item: &WorkItem) -> bool {
    if let Some(state) = self.state {
      if item.state != state {
        return false;
      }
    }
    if let Some(priority) = &self.priority {
      if item.priority.as_deref() != Some(priority.as_str()) {
        return false;
      }
    }
    if let Some(item_type) = &self.item_type {
      if !item.item_type.eq_ignore_ascii_case(item_type) {
        return false;
      }
    }
    if let Some(assignee) = &self.assignee {
      let matched = item
        .assignee
        .as_deref()
        .map(|a| a.eq_ignore_ascii_case(assignee))
        .unwrap_or(false);
      if !matched {
        return false;
      }
    }
    if let Some(search) = &self.search {
      let needle = search.to_lowercase();
      if !item.title.to_lowercase().contains(&needle)
        && !item.key.to_lowercase().contains(&needle)
      {
        return false;
      }
    }
    true
  }
}

/// Attribute filters applied to a group's member merge requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberCriteria {
  pub author: Option<String>,
  pub reviewer: Option<String>,
  pub label: Option<String>,
  /// Only members created within the last N days.
  pub max_age_days: Option<i64>,
}

impl MemberCriteria {
  fn matches(&self, member: &EnrichedMergeRequest, now: DateTime<Utc>) -> bool {
    let mr = &member.merge_request;
    if let Some(author) = &self.author {
      if !mr.author.eq_ignore_ascii_case(author) {
        return false;
      }
    }
    if let Some(reviewer) = &self.reviewer {
      if !mr.reviewers.iter().any(|r| r.eq_ignore_ascii_case(reviewer)) {
        return false;
      }
    }
    if let Some(label) = &self.label {
      if !mr.labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
        return false;
      }
    }
    if let Some(max_age_days) = self.max_age_days {
      if now - mr.created_at > Duration::days(max_age_days) {
        return false;
      }
    }
    true
  }
}

/// Group enriched merge requests by their resolved work item.
///
/// Records with no resolved reference, or whose work item could not be
/// looked up, belong to no group. Thresholds are read at call time, so a
/// configuration change shows up on the next pass without invalidation.
pub fn group_by_reference(
  enriched: Vec<EnrichedMergeRequest>,
  thresholds: &Thresholds,
) -> Vec<TicketGroup> {
  group_by_reference_at(enriched, thresholds, Utc::now())
}

/// `group_by_reference` with an explicit clock, for age-count tests.
pub fn group_by_reference_at(
  enriched: Vec<EnrichedMergeRequest>,
  thresholds: &Thresholds,
  now: DateTime<Utc>,
) -> Vec<TicketGroup> {
  // Preserve first-seen order of work items
  let mut order: Vec<String> = Vec::new();
  let mut buckets: HashMap<String, (WorkItem, Vec<EnrichedMergeRequest>)> = HashMap::new();

  for record in enriched {
    let Some(item) = record.work_item.clone() else {
      continue;
    };

    match buckets.get_mut(&item.key) {
      Some((_, members)) => members.push(record),
      None => {
        order.push(item.key.clone());
        buckets.insert(item.key.clone(), (item, vec![record]));
      }
    }
  }

  order
    .into_iter()
    .filter_map(|key| buckets.remove(&key))
    .map(|(work_item, members)| build_group(work_item, members, thresholds, now))
    .collect()
}

fn build_group(
  work_item: WorkItem,
  members: Vec<EnrichedMergeRequest>,
  thresholds: &Thresholds,
  now: DateTime<Utc>,
) -> TicketGroup {
  let total = members.len();
  let open = members
    .iter()
    .filter(|m| m.merge_request.is_open())
    .count();
  let overdue = members
    .iter()
    .filter(|m| now - m.merge_request.created_at > Duration::days(thresholds.overdue_days))
    .count();
  let stalled = members
    .iter()
    .filter(|m| now - m.merge_request.updated_at > Duration::days(thresholds.stalled_days))
    .count();

  TicketGroup {
    work_item,
    merge_requests: members,
    total,
    open,
    overdue,
    stalled,
  }
}

/// Keep the groups whose work item matches all present criteria.
pub fn filter_groups(groups: Vec<TicketGroup>, criteria: &GroupCriteria) -> Vec<TicketGroup> {
  groups
    .into_iter()
    .filter(|g| criteria.matches(&g.work_item))
    .collect()
}

/// Filter each group's member list; a group survives when at least one
/// member matches, with counts recomputed for the survivors.
pub fn filter_members(
  groups: Vec<TicketGroup>,
  criteria: &MemberCriteria,
  thresholds: &Thresholds,
) -> Vec<TicketGroup> {
  filter_members_at(groups, criteria, thresholds, Utc::now())
}

/// `filter_members` with an explicit clock.
pub fn filter_members_at(
  groups: Vec<TicketGroup>,
  criteria: &MemberCriteria,
  thresholds: &Thresholds,
  now: DateTime<Utc>,
) -> Vec<TicketGroup> {
  groups
    .into_iter()
    .filter_map(|group| {
      let members: Vec<EnrichedMergeRequest> = group
        .merge_requests
        .into_iter()
        .filter(|m| criteria.matches(m, now))
        .collect();

      if members.is_empty() {
        return None;
      }
      Some(build_group(group.work_item, members, thresholds, now))
    })
    .collect()
}
