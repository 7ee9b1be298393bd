//! Fetching the catalog and firmware files
//!
//! A catalog is served either from a web host (the same layout the web
//! flasher uses: `config.json` next to the page and a `/releases` endpoint)
//! or from a local directory holding `config.json` and, optionally,
//! `releases.json`.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, info, warn};
use reqwest::Url;

use super::{Catalog, FirmwareFile, Release};
use crate::error::Error;

const CONFIG_FILE: &str = "config.json";
const RELEASES_ENDPOINT: &str = "/releases";
const RELEASES_FILE: &str = "releases.json";

/// Where the catalog is loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    /// Base URL of a web flasher deployment
    Remote(Url),
    /// Local directory containing the catalog documents
    Local(PathBuf),
}

/// Where a single file can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareLocation {
    Remote(Url),
    Local(PathBuf),
}

impl FromStr for CatalogSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_url(s) {
            // Without the trailing slash the last path segment would be
            // replaced when joining relative names.
            let base = if s.ends_with('/') {
                s.to_owned()
            } else {
                format!("{s}/")
            };

            Url::parse(&base)
                .map(CatalogSource::Remote)
                .map_err(|_| Error::InvalidUrl(s.to_owned()))
        } else {
            Ok(CatalogSource::Local(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogSource::Remote(url) => write!(f, "{url}"),
            CatalogSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl fmt::Display for FirmwareLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareLocation::Remote(url) => write!(f, "{url}"),
            FirmwareLocation::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

impl CatalogSource {
    /// Resolve a path relative to the root of the source.
    ///
    /// Absolute URLs are used verbatim. On a web host, names starting with
    /// `/` are relative to the host rather than the base path.
    pub fn resolve(&self, name: &str) -> Result<FirmwareLocation, Error> {
        if is_url(name) {
            return Url::parse(name)
                .map(FirmwareLocation::Remote)
                .map_err(|_| Error::InvalidUrl(name.to_owned()));
        }

        match self {
            CatalogSource::Remote(base) => base
                .join(name)
                .map(FirmwareLocation::Remote)
                .map_err(|_| Error::InvalidUrl(name.to_owned())),
            CatalogSource::Local(dir) => Ok(FirmwareLocation::Local(
                dir.join(name.trim_start_matches('/')),
            )),
        }
    }

    /// Location of a catalog firmware file.
    ///
    /// Names which are not already absolute are looked up under the
    /// catalog's static path.
    pub fn firmware_location(
        &self,
        catalog: &Catalog,
        file: &FirmwareFile,
    ) -> Result<FirmwareLocation, Error> {
        if let Some(path) = &file.local {
            return Ok(FirmwareLocation::Local(path.clone()));
        }

        if file.name.starts_with('/') || is_url(&file.name) {
            self.resolve(&file.name)
        } else {
            self.resolve(&format!("{}/{}", catalog.static_path, file.name))
        }
    }

    fn releases_location(&self) -> Result<FirmwareLocation, Error> {
        match self {
            CatalogSource::Remote(_) => self.resolve(RELEASES_ENDPOINT),
            CatalogSource::Local(_) => self.resolve(RELEASES_FILE),
        }
    }
}

impl FirmwareLocation {
    /// Read the complete contents of the file.
    pub fn read(&self) -> Result<Vec<u8>, Error> {
        match self {
            FirmwareLocation::Remote(url) => download(url),
            FirmwareLocation::Local(path) => read_local(path),
        }
    }

    fn read_to_string(&self) -> Result<String, Error> {
        let data = self.read()?;
        String::from_utf8(data).map_err(|e| {
            Error::FileOpenError(
                self.to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// The file name, used to label local and downloaded images
    pub fn file_name(&self) -> String {
        match self {
            FirmwareLocation::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_owned(),
            FirmwareLocation::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

fn download(url: &Url) -> Result<Vec<u8>, Error> {
    debug!("Downloading {url}");

    let fetch_error = |source| Error::Fetch {
        url: url.to_string(),
        source,
    };

    let response = reqwest::blocking::get(url.clone())
        .and_then(|response| response.error_for_status())
        .map_err(fetch_error)?;
    let bytes = response.bytes().map_err(fetch_error)?;

    Ok(bytes.to_vec())
}

fn read_local(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}

/// Load the catalog from `source` and merge the published releases into it.
///
/// `releases` overrides where the releases document is read from.
pub fn load_catalog(source: &CatalogSource, releases: Option<&str>) -> Result<Catalog, Error> {
    let config = source.resolve(CONFIG_FILE)?;
    info!("Loading catalog from {config}");

    let mut catalog = Catalog::from_json(&config.read_to_string()?)?;

    let releases_location = match releases {
        Some(releases) => source.resolve(releases)?,
        None => source.releases_location()?,
    };

    let releases = match (&releases_location, source) {
        // A static local catalog does not need to publish releases at all
        (FirmwareLocation::Local(path), CatalogSource::Local(_))
            if releases.is_none() && !path.exists() =>
        {
            warn!("No releases document found at {}", path.display());
            Vec::new()
        }
        _ => Release::list_from_json(&releases_location.read_to_string()?)?,
    };

    debug!("Merging {} releases into the catalog", releases.len());
    catalog.merge_releases(&releases);

    Ok(catalog)
}

/// Read the image of a firmware file, downloading it if needed.
pub fn fetch_firmware(
    source: &CatalogSource,
    catalog: &Catalog,
    file: &FirmwareFile,
) -> Result<Vec<u8>, Error> {
    let location = source.firmware_location(catalog, file)?;
    info!("Reading firmware from {location}");

    location.read()
}
