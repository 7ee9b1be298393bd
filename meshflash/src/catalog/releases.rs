//! Firmware versions published as releases
//!
//! The releases document is a flat list of published releases, each tagged
//! with the firmware role it belongs to. A catalog firmware selects its
//! files out of every release of its role with name patterns.

use serde::{Deserialize, Serialize};

use super::{FirmwareFile, OrderedMap, Version, Versions};
use crate::error::Error;

/// A release in the releases document
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Release {
    /// Firmware role this release belongs to
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub files: Vec<ReleaseFile>,
}

/// A downloadable asset of a release
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReleaseFile {
    pub name: String,
    pub url: String,
}

/// A `[startsWith, endsWith]` pattern matched against release file names
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilePattern(pub String, pub String);

impl FilePattern {
    pub fn new(starts_with: impl Into<String>, ends_with: impl Into<String>) -> Self {
        Self(starts_with.into(), ends_with.into())
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.0) && name.ends_with(&self.1)
    }
}

impl Release {
    /// Parse a releases document.
    pub fn list_from_json(data: &str) -> Result<Vec<Self>, Error> {
        serde_json::from_str(data).map_err(|source| Error::CatalogParse {
            document: "releases",
            source,
        })
    }
}

/// Build the version list of a firmware from the releases of `role`.
///
/// Every release of the role yields a version, in the order the releases
/// are listed, even when none of its files match. Matching files are added
/// for each file type in the order the patterns are declared.
pub fn releases_for_role(
    role: &str,
    files: &OrderedMap<FilePattern>,
    releases: &[Release],
) -> Versions {
    let mut versions = Versions::new();

    for (file_type, pattern) in files.iter() {
        for release in releases.iter().filter(|release| release.kind == role) {
            let version = versions
                .entry(release.version.clone())
                .or_insert_with(|| Version {
                    notes: release.notes.clone(),
                    ..Version::default()
                });

            version.files.extend(
                release
                    .files
                    .iter()
                    .filter(|file| pattern.matches(&file.name))
                    .map(|file| FirmwareFile {
                        kind: file_type.to_owned(),
                        name: file.url.clone(),
                        title: file.name.clone(),
                        local: None,
                    }),
            );
        }
    }

    versions
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::{tests::CATALOG, Catalog};

    const RELEASES: &str = r#"[
        {
            "type": "repeater",
            "version": "v1.2.0",
            "notes": "Faster adverts",
            "files": [
                { "name": "Heltec_v3_repeater-v1.2.0.bin", "url": "/releases/Heltec_v3_repeater-v1.2.0.bin" },
                { "name": "Heltec_v3_repeater-v1.2.0-merged.hex", "url": "/releases/Heltec_v3_repeater-v1.2.0-merged.hex" },
                { "name": "RAK_4631_repeater-v1.2.0.zip", "url": "/releases/RAK_4631_repeater-v1.2.0.zip" }
            ]
        },
        {
            "type": "companion",
            "version": "v1.2.0",
            "notes": "Companion release",
            "files": [
                { "name": "Heltec_v3_companion-v1.2.0.bin", "url": "/releases/Heltec_v3_companion-v1.2.0.bin" }
            ]
        },
        {
            "type": "repeater",
            "version": "v1.1.0",
            "notes": "Initial release",
            "files": [
                { "name": "RAK_4631_repeater-v1.1.0.zip", "url": "/releases/RAK_4631_repeater-v1.1.0.zip" }
            ]
        }
    ]"#;

    fn patterns(entries: &[(&str, &str, &str)]) -> OrderedMap<FilePattern> {
        entries
            .iter()
            .map(|(kind, start, end)| (kind.to_string(), FilePattern::new(*start, *end)))
            .collect()
    }

    #[test]
    fn versions_follow_release_order() {
        let releases = Release::list_from_json(RELEASES).unwrap();
        let files = patterns(&[("flash", "Heltec_v3_repeater", ".bin")]);

        let versions = releases_for_role("repeater", &files, &releases);

        assert_eq!(versions.keys().collect::<Vec<_>>(), ["v1.2.0", "v1.1.0"]);

        let newest = versions.get("v1.2.0").unwrap();
        assert_eq!(newest.notes, "Faster adverts");
        assert_eq!(
            newest.files,
            vec![FirmwareFile {
                kind: "flash".into(),
                name: "/releases/Heltec_v3_repeater-v1.2.0.bin".into(),
                title: "Heltec_v3_repeater-v1.2.0.bin".into(),
                local: None,
            }]
        );

        // The older release has no Heltec build, but is still listed
        assert!(versions.get("v1.1.0").unwrap().files.is_empty());
    }

    #[test]
    fn files_grouped_by_declared_type() {
        let releases = Release::list_from_json(RELEASES).unwrap();
        let files = patterns(&[
            ("flash", "Heltec_v3_repeater", ".bin"),
            ("hex", "Heltec_v3_repeater", "-merged.hex"),
        ]);

        let versions = releases_for_role("repeater", &files, &releases);
        let kinds = versions
            .get("v1.2.0")
            .unwrap()
            .files
            .iter()
            .map(|file| file.kind.as_str())
            .collect::<Vec<_>>();

        assert_eq!(kinds, ["flash", "hex"]);
    }

    #[test]
    fn unknown_role_yields_nothing() {
        let releases = Release::list_from_json(RELEASES).unwrap();
        let files = patterns(&[("flash", "", "")]);

        assert!(releases_for_role("room-server", &files, &releases).is_empty());
    }

    #[test]
    fn merge_replaces_github_versions() {
        let mut catalog = Catalog::from_json(CATALOG).unwrap();
        let releases = Release::list_from_json(RELEASES).unwrap();

        catalog.merge_releases(&releases);

        let heltec = &catalog.device[0];
        assert!(heltec.firmware[0].has_data());
        assert_eq!(heltec.firmware[0].default_version(), Some("v1.2.0"));

        // Firmware without a release source keeps its catalog versions
        assert_eq!(heltec.firmware[1].default_version(), Some("v1.1.0"));
        assert_eq!(catalog.device[1].firmware[0].version.len(), 1);
    }

    #[test]
    fn malformed_releases_document() {
        assert!(matches!(
            Release::list_from_json(r#"{"type": "repeater"}"#),
            Err(Error::CatalogParse {
                document: "releases",
                ..
            })
        ));
    }
}
