use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use beacon_util::config::StoredConfig;

/// Points sampled per application type
///
/// Stored as the `points` configuration document, e.g.
/// `{"Global Data": ["OatOut"]}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PointLibrary(BTreeMap<String, Vec<String>>);

impl PointLibrary {
    pub fn points(&self, apptype: &str) -> Option<&[String]> {
        self.0.get(apptype).map(Vec::as_slice)
    }
}

impl Default for PointLibrary {
    fn default() -> Self {
        PointLibrary(BTreeMap::from([(
            "Global Data".to_owned(),
            vec!["OatOut".to_owned()],
        )]))
    }
}

impl<K: Into<String>, V: IntoIterator<Item = P>, P: Into<String>> FromIterator<(K, V)>
    for PointLibrary
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        PointLibrary(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into_iter().map(Into::into).collect()))
                .collect(),
        )
    }
}

impl StoredConfig for PointLibrary {
    fn kind() -> &'static str {
        "points"
    }
}

/// An application running on the controller and the points sampled for it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PointGroup {
    pub iid: String,
    pub appname: String,
    pub apptype: String,
    pub points: Vec<String>,
}

impl PointGroup {
    /// Wire address of every point, `{iid}:{point}`
    pub fn pointers(&self) -> impl Iterator<Item = String> + '_ {
        self.points.iter().map(|p| format!("{}:{p}", self.iid))
    }
}

#[derive(Deserialize)]
struct Application {
    iid: String,
    #[serde(default)]
    appname: String,
    apptype: String,
}

/// Ordered point groups of a controller
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    groups: Vec<PointGroup>,
}

impl Inventory {
    /// Build an inventory from the `aps` list of a `GetSystemInventory`
    /// result
    ///
    /// Applications of a type the library does not know are skipped.
    /// Returns `None` if the list is missing or malformed.
    pub fn from_applications(aps: &Value, library: &PointLibrary) -> Option<Self> {
        let apps: Vec<Application> = serde_json::from_value(aps.clone()).ok()?;

        let groups = apps
            .into_iter()
            .filter_map(|app| match library.points(&app.apptype) {
                Some(points) => Some(PointGroup {
                    iid: app.iid,
                    appname: app.appname,
                    apptype: app.apptype,
                    points: points.to_vec(),
                }),
                None => {
                    warn!(apptype = %app.apptype, iid = %app.iid, "unknown application type");
                    None
                }
            })
            .collect();

        Some(Self { groups })
    }

    pub fn groups(&self) -> &[PointGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn library() -> PointLibrary {
        PointLibrary::from_iter([
            ("Global Data", vec!["OatOut"]),
            ("AHU", vec!["SupplyTemp", "ReturnTemp"]),
        ])
    }

    #[test]
    fn it_skips_unknown_application_types() {
        let aps = json!([
            { "iid": "0001", "appname": "Outdoor", "apptype": "Global Data", "category": "x" },
            { "iid": "0002", "appname": "Mystery", "apptype": "Unknown" },
            { "iid": "0003", "appname": "AHU-1", "apptype": "AHU" }
        ]);

        let inventory = Inventory::from_applications(&aps, &library()).unwrap();

        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.groups()[0].iid, "0001");
        assert_eq!(inventory.groups()[1].points, vec!["SupplyTemp", "ReturnTemp"]);
    }

    #[test]
    fn it_rejects_malformed_application_lists() {
        assert!(Inventory::from_applications(&json!({"aps": 1}), &library()).is_none());
        assert!(Inventory::from_applications(&json!([{ "appname": "x" }]), &library()).is_none());
    }

    #[test]
    fn it_addresses_points_by_instance() {
        let group = PointGroup {
            iid: "00A1".into(),
            appname: "AHU-1".into(),
            apptype: "AHU".into(),
            points: vec!["SupplyTemp".into(), "ReturnTemp".into()],
        };

        let pointers: Vec<String> = group.pointers().collect();
        assert_eq!(pointers, vec!["00A1:SupplyTemp", "00A1:ReturnTemp"]);
    }

    #[test]
    fn it_reads_the_library_document() {
        let library: PointLibrary =
            serde_json::from_value(json!({ "Global Data": ["OatOut"] })).unwrap();

        assert_eq!(library, PointLibrary::default());
        assert_eq!(library.points("Global Data"), Some(&["OatOut".to_owned()][..]));
    }
}
