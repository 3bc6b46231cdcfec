//! Device menu model.
//!
//! The input daemon hosts the ordered menu; sources add and remove their
//! entries over RPC. Ordering is deterministic across restarts: the initial
//! sequence comes from configuration and every mutation is positional.

use serde::Deserialize;
use thiserror::Error;

use crate::bus::MenuItem;

#[derive(Debug, Error, PartialEq)]
pub enum MenuError {
    #[error("menu action `{0}` needs an item")]
    MissingItem(String),
    #[error("menu action `remove` needs an id")]
    MissingId,
    #[error("unknown menu action `{0}`")]
    UnknownAction(String),
}

/// RPC body for `POST /input/menu`.
#[derive(Debug, Clone, Deserialize)]
pub struct MenuRequest {
    pub action: String,
    #[serde(default)]
    pub item: Option<MenuItem>,
    /// Label (or source id) of the entry to insert after; append if absent
    /// or unmatched.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<MenuItem>>,
}

#[derive(Debug, Clone, Default)]
pub struct MenuModel {
    items: Vec<MenuItem>,
}

impl MenuModel {
    pub fn new(initial: Vec<MenuItem>) -> Self {
        Self { items: initial }
    }

    pub fn snapshot(&self) -> Vec<MenuItem> {
        self.items.clone()
    }

    /// Apply one mutation. Returns whether the sequence changed (only
    /// changes broadcast a `menu_update`).
    pub fn apply(&mut self, request: MenuRequest) -> Result<bool, MenuError> {
        match request.action.as_str() {
            "add" => {
                let item = request
                    .item
                    .ok_or_else(|| MenuError::MissingItem("add".into()))?;
                // Re-adding the same entry is idempotent.
                if self.items.contains(&item) {
                    return Ok(false);
                }
                let index = request
                    .after
                    .as_deref()
                    .and_then(|after| self.position(after))
                    .map(|found| found + 1)
                    .unwrap_or(self.items.len());
                self.items.insert(index, item);
                Ok(true)
            }
            "remove" => {
                let id = request.id.ok_or(MenuError::MissingId)?;
                let before = self.items.len();
                self.items.retain(|item| !Self::matches(item, &id));
                Ok(self.items.len() != before)
            }
            "replace" => {
                let items = request
                    .items
                    .or_else(|| request.item.map(|single| vec![single]))
                    .ok_or_else(|| MenuError::MissingItem("replace".into()))?;
                let changed = self.items != items;
                self.items = items;
                Ok(changed)
            }
            other => Err(MenuError::UnknownAction(other.to_string())),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|item| Self::matches(item, key))
    }

    fn matches(item: &MenuItem, key: &str) -> bool {
        item.label == key
            || item.route == key
            || item.source_id.as_deref() == Some(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn item(label: &str) -> MenuItem {
        MenuItem {
            label: label.into(),
            route: format!("menu/{}", label.to_lowercase()),
            source_id: None,
        }
    }

    fn labels(model: &MenuModel) -> Vec<String> {
        model.snapshot().into_iter().map(|i| i.label).collect()
    }

    #[test]
    fn add_after_inserts_at_preset_position() {
        let mut model = MenuModel::new(vec![item("A"), item("B"), item("C")]);
        let changed = model
            .apply(MenuRequest {
                action: "add".into(),
                item: Some(item("D")),
                after: Some("B".into()),
                id: None,
                items: None,
            })
            .unwrap();
        assert!(changed);
        assert_eq!(labels(&model), vec!["A", "B", "D", "C"]);
    }

    #[test]
    fn add_without_anchor_appends() {
        let mut model = MenuModel::new(vec![item("A")]);
        model
            .apply(MenuRequest {
                action: "add".into(),
                item: Some(item("Z")),
                after: Some("missing".into()),
                id: None,
                items: None,
            })
            .unwrap();
        assert_eq!(labels(&model), vec!["A", "Z"]);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut model = MenuModel::new(vec![item("A")]);
        let changed = model
            .apply(MenuRequest {
                action: "add".into(),
                item: Some(item("A")),
                after: None,
                id: None,
                items: None,
            })
            .unwrap();
        assert!(!changed);
        assert_eq!(labels(&model), vec!["A"]);
    }

    #[test]
    fn remove_matches_label_route_or_source_id() {
        let mut model = MenuModel::new(vec![
            item("A"),
            MenuItem {
                label: "CD".into(),
                route: "menu/cd".into(),
                source_id: Some("cd".into()),
            },
        ]);
        let changed = model
            .apply(MenuRequest {
                action: "remove".into(),
                item: None,
                after: None,
                id: Some("cd".into()),
                items: None,
            })
            .unwrap();
        assert!(changed);
        assert_eq!(labels(&model), vec!["A"]);
    }

    #[test]
    fn replace_swaps_the_whole_sequence() {
        let mut model = MenuModel::new(vec![item("A")]);
        model
            .apply(MenuRequest {
                action: "replace".into(),
                item: None,
                after: None,
                id: None,
                items: Some(vec![item("X"), item("Y")]),
            })
            .unwrap();
        assert_eq!(labels(&model), vec!["X", "Y"]);
    }

    #[test]
    fn unknown_action_is_an_error() {
        let mut model = MenuModel::new(vec![]);
        let err = model
            .apply(MenuRequest {
                action: "rotate".into(),
                item: None,
                after: None,
                id: None,
                items: None,
            })
            .unwrap_err();
        assert_eq!(err, MenuError::UnknownAction("rotate".into()));
    }
}
