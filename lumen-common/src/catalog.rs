//! Course catalog contract
//!
//! Courses and modules are static reference data. Services read them through
//! [`CatalogProvider`]; nothing in the progress core mutates them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::info;

/// Course metadata as shown in listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCatalogEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Learning goal category the course belongs to
    #[serde(default)]
    pub category: String,
    /// Human-readable length, e.g. "4 weeks"
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// One module (video lesson) of a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCatalogEntry {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub duration_minutes: i64,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Position within the course, ascending
    pub order: i64,
    #[serde(default)]
    pub video_url: Option<String>,
}

/// Read-only access to course and module metadata
pub trait CatalogProvider: Send + Sync {
    fn list_courses(&self) -> Vec<CourseCatalogEntry>;

    /// Fails with [`Error::NotFound`] for unknown ids
    fn get_course(&self, course_id: &str) -> Result<CourseCatalogEntry>;

    /// Modules ordered by `order`; fails with [`Error::NotFound`] for unknown ids
    fn get_modules(&self, course_id: &str) -> Result<Vec<ModuleCatalogEntry>>;

    /// Single module lookup
    fn get_module(&self, course_id: &str, module_id: i64) -> Result<ModuleCatalogEntry> {
        self.get_modules(course_id)?
            .into_iter()
            .find(|m| m.id == module_id)
            .ok_or_else(|| {
                Error::NotFound(format!("module {} in course '{}'", module_id, course_id))
            })
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    courses: Vec<CourseDefinition>,
}

#[derive(Debug, Deserialize)]
struct CourseDefinition {
    #[serde(flatten)]
    course: CourseCatalogEntry,
    #[serde(default)]
    modules: Vec<ModuleCatalogEntry>,
}

/// In-memory catalog loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    courses: BTreeMap<String, (CourseCatalogEntry, Vec<ModuleCatalogEntry>)>,
}

impl StaticCatalog {
    /// Build a catalog, validating id uniqueness and sorting modules
    pub fn new(
        entries: impl IntoIterator<Item = (CourseCatalogEntry, Vec<ModuleCatalogEntry>)>,
    ) -> Result<Self> {
        let mut courses = BTreeMap::new();
        for (course, mut modules) in entries {
            if course.id.trim().is_empty() {
                return Err(Error::Config("catalog course with empty id".to_string()));
            }
            let mut seen = HashSet::new();
            for module in &modules {
                if !seen.insert(module.id) {
                    return Err(Error::Config(format!(
                        "duplicate module id {} in course '{}'",
                        module.id, course.id
                    )));
                }
            }
            modules.sort_by_key(|m| (m.order, m.id));
            let id = course.id.clone();
            if courses.insert(id.clone(), (course, modules)).is_some() {
                return Err(Error::Config(format!("duplicate course id '{}'", id)));
            }
        }
        Ok(Self { courses })
    }

    /// Parse a TOML catalog (`[[courses]]` with nested `[[courses.modules]]`)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid catalog file: {}", e)))?;
        Self::new(file.courses.into_iter().map(|d| (d.course, d.modules)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml_str(&content)?;
        info!(
            "Loaded catalog with {} courses from {}",
            catalog.courses.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Catalog seeded with the platform's starter courses
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_CATALOG).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

impl CatalogProvider for StaticCatalog {
    fn list_courses(&self) -> Vec<CourseCatalogEntry> {
        self.courses.values().map(|(c, _)| c.clone()).collect()
    }

    fn get_course(&self, course_id: &str) -> Result<CourseCatalogEntry> {
        self.courses
            .get(course_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| Error::NotFound(format!("course '{}'", course_id)))
    }

    fn get_modules(&self, course_id: &str) -> Result<Vec<ModuleCatalogEntry>> {
        self.courses
            .get(course_id)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| Error::NotFound(format!("course '{}'", course_id)))
    }
}

const BUILTIN_CATALOG: &str = r#"
[[courses]]
id = "html-css-mastery"
title = "HTML & CSS Mastery"
description = "Structure and style modern web pages."
category = "web-development"
duration = "4 weeks"
topics = ["html", "css", "layout"]

[[courses.modules]]
id = 1
order = 1
title = "Document Structure"
duration_minutes = 18
topics = ["html"]

[[courses.modules]]
id = 2
order = 2
title = "Text and Semantics"
duration_minutes = 22
topics = ["html", "accessibility"]

[[courses.modules]]
id = 3
order = 3
title = "Selectors and the Cascade"
duration_minutes = 25
topics = ["css"]

[[courses.modules]]
id = 4
order = 4
title = "The Box Model"
duration_minutes = 20
topics = ["css"]

[[courses.modules]]
id = 5
order = 5
title = "Flexbox"
duration_minutes = 30
topics = ["css", "layout"]

[[courses.modules]]
id = 6
order = 6
title = "Grid"
duration_minutes = 30
topics = ["css", "layout"]

[[courses.modules]]
id = 7
order = 7
title = "Responsive Design"
duration_minutes = 28
topics = ["css", "media-queries"]

[[courses.modules]]
id = 8
order = 8
title = "Capstone Page"
duration_minutes = 45
topics = ["project"]

[[courses]]
id = "javascript-fundamentals"
title = "JavaScript Fundamentals"
description = "Values, functions and the DOM."
category = "web-development"
duration = "5 weeks"
topics = ["javascript"]

[[courses.modules]]
id = 1
order = 1
title = "Values and Types"
duration_minutes = 20

[[courses.modules]]
id = 2
order = 2
title = "Control Flow"
duration_minutes = 22

[[courses.modules]]
id = 3
order = 3
title = "Functions"
duration_minutes = 26

[[courses.modules]]
id = 4
order = 4
title = "Objects and Arrays"
duration_minutes = 28

[[courses.modules]]
id = 5
order = 5
title = "Working with the DOM"
duration_minutes = 32

[[courses.modules]]
id = 6
order = 6
title = "Async JavaScript"
duration_minutes = 35

[[courses]]
id = "python-data-basics"
title = "Python for Data"
description = "Load, clean and summarize data with Python."
category = "data-science"
duration = "3 weeks"
topics = ["python", "data"]

[[courses.modules]]
id = 1
order = 1
title = "Python Refresher"
duration_minutes = 25

[[courses.modules]]
id = 2
order = 2
title = "Reading Data"
duration_minutes = 20

[[courses.modules]]
id = 3
order = 3
title = "Cleaning Data"
duration_minutes = 30

[[courses.modules]]
id = 4
order = 4
title = "Summaries and Charts"
duration_minutes = 30
"#;
