//! Aggregation queries backing the sidebar trees.
//!
//! Everything here is one query per call; the folder tree in particular
//! returns recursive counts for every folder of a project in a single
//! recursive CTE instead of a count query per node.

use anyhow::Result;
use chrono::{Datelike, Duration, Local, NaiveDate};
use rusqlite::params;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::db::CatalogDb;
use crate::geocode::Geocoder;

/// Which timestamp a quick-date window filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    /// `date(COALESCE(date_taken, modified))`
    Meta,
    /// `updated_at` (when the row was last indexed)
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickRange {
    Today,
    ThisWeek,
    ThisMonth,
    Last30Days,
    ThisYear,
    RecentlyIndexed,
}

/// GPS bucket for the locations section.
#[derive(Debug, Clone)]
pub struct LocationBucket {
    pub lat: f64,
    pub lon: f64,
    pub count: i64,
    pub name: Option<String>,
}

pub struct Aggregator {
    db: Arc<CatalogDb>,
}

impl Aggregator {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self { db }
    }

    /// Recursive photo count for every folder of the project, in one query.
    /// The map contains an entry for each folder, including empty ones.
    pub fn folder_photo_counts(&self, project_id: i64) -> Result<HashMap<i64, i64>> {
        self.folder_counts(project_id, "photo_metadata")
    }

    /// Same query shape over videos.
    pub fn folder_video_counts(&self, project_id: i64) -> Result<HashMap<i64, i64>> {
        self.folder_counts(project_id, "video_metadata")
    }

    fn folder_counts(&self, project_id: i64, table: &str) -> Result<HashMap<i64, i64>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "WITH RECURSIVE tree(root_id, node_id) AS (
                     SELECT id, id FROM photo_folders WHERE project_id = ?1
                     UNION ALL
                     SELECT t.root_id, f.id
                     FROM photo_folders f
                     JOIN tree t ON f.parent_id = t.node_id
                 )
                 SELECT t.root_id, COUNT(m.id)
                 FROM tree t
                 LEFT JOIN {table} m ON m.folder_id = t.node_id AND m.project_id = ?1
                 GROUP BY t.root_id"
            ))?;
            let counts = stmt
                .query_map([project_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }

    /// `{year: {month: [day, ...]}}` from distinct `created_date` values.
    pub fn date_hierarchy(&self, project_id: i64) -> Result<BTreeMap<i32, BTreeMap<u32, Vec<u32>>>> {
        let dates = self.db.distinct_created_dates(project_id)?;
        let mut hierarchy: BTreeMap<i32, BTreeMap<u32, Vec<u32>>> = BTreeMap::new();
        for date in dates {
            let Ok(parsed) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
                continue;
            };
            hierarchy
                .entry(parsed.year())
                .or_default()
                .entry(parsed.month())
                .or_default()
                .push(parsed.day());
        }
        Ok(hierarchy)
    }

    /// Combined photo + video counts per `created_date`, via UNION ALL over
    /// the two metadata tables.
    pub fn combined_counts_by_date(&self, project_id: i64) -> Result<BTreeMap<String, i64>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT created_date, COUNT(*) FROM (
                     SELECT created_date FROM photo_metadata
                     WHERE project_id = ?1 AND created_date IS NOT NULL
                     UNION ALL
                     SELECT created_date FROM video_metadata
                     WHERE project_id = ?1 AND created_date IS NOT NULL
                 )
                 GROUP BY created_date
                 ORDER BY created_date",
            )?;
            let counts = stmt
                .query_map([project_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }

    /// Combined photo + video counts per year.
    pub fn combined_counts_by_year(&self, project_id: i64) -> Result<BTreeMap<i64, i64>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT created_year, COUNT(*) FROM (
                     SELECT created_year FROM photo_metadata
                     WHERE project_id = ?1 AND created_year IS NOT NULL
                     UNION ALL
                     SELECT created_year FROM video_metadata
                     WHERE project_id = ?1 AND created_year IS NOT NULL
                 )
                 GROUP BY created_year
                 ORDER BY created_year",
            )?;
            let counts = stmt
                .query_map([project_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }

    /// Resolve a quick-date window to `(start, end, mode)`, both bounds
    /// inclusive, relative to `today`.
    pub fn quick_range_bounds(range: QuickRange, today: NaiveDate) -> (NaiveDate, NaiveDate, DateMode) {
        match range {
            QuickRange::Today => (today, today, DateMode::Meta),
            QuickRange::ThisWeek => {
                let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
                (start, today, DateMode::Meta)
            }
            QuickRange::ThisMonth => {
                let start = today.with_day(1).unwrap_or(today);
                (start, today, DateMode::Meta)
            }
            QuickRange::Last30Days => (today - Duration::days(30), today, DateMode::Meta),
            QuickRange::ThisYear => {
                let start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
                (start, today, DateMode::Meta)
            }
            QuickRange::RecentlyIndexed => (today - Duration::days(7), today, DateMode::Updated),
        }
    }

    /// Photo count within a quick-date window.
    pub fn count_in_quick_range(&self, project_id: i64, range: QuickRange) -> Result<i64> {
        let (start, end, mode) = Self::quick_range_bounds(range, Local::now().date_naive());
        let start = start.format("%Y-%m-%d").to_string();
        let end = end.format("%Y-%m-%d").to_string();

        self.db.with_conn(|conn| {
            let sql = match mode {
                DateMode::Meta => {
                    "SELECT COUNT(*) FROM photo_metadata
                     WHERE project_id = ?
                       AND date(COALESCE(date_taken, modified)) BETWEEN ? AND ?"
                }
                DateMode::Updated => {
                    "SELECT COUNT(*) FROM photo_metadata
                     WHERE project_id = ?
                       AND date(updated_at) BETWEEN ? AND ?"
                }
            };
            Ok(conn.query_row(sql, params![project_id, start, end], |row| row.get(0))?)
        })
    }

    /// Paths in a branch that also carry a tag, resolved by one indexed
    /// join; no loading a branch into memory to filter it.
    pub fn images_by_branch_and_tag(
        &self,
        project_id: i64,
        branch_key: &str,
        tag_name: &str,
    ) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT pi.image_path
                 FROM project_images pi
                 JOIN photo_metadata pm
                   ON pm.path = pi.image_path AND pm.project_id = pi.project_id
                 JOIN photo_tags pt ON pt.photo_id = pm.id
                 JOIN tags t ON t.id = pt.tag_id
                 WHERE pi.project_id = ? AND pi.branch_key = ?
                   AND t.name = ? COLLATE NOCASE
                 ORDER BY pi.image_path",
            )?;
            let paths = stmt
                .query_map(params![project_id, branch_key, tag_name], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(paths)
        })
    }

    /// GPS location buckets at ~1 km granularity (2 decimal places), most
    /// populated first. Names resolve through the injected geocoder cache.
    pub fn location_buckets(
        &self,
        project_id: i64,
        geocoder: Option<&dyn Geocoder>,
        limit: i64,
    ) -> Result<Vec<LocationBucket>> {
        let mut buckets = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ROUND(gps_latitude, 2), ROUND(gps_longitude, 2), COUNT(*)
                 FROM photo_metadata
                 WHERE project_id = ? AND gps_latitude IS NOT NULL AND gps_longitude IS NOT NULL
                 GROUP BY ROUND(gps_latitude, 2), ROUND(gps_longitude, 2)
                 ORDER BY COUNT(*) DESC
                 LIMIT ?",
            )?;
            let buckets: Vec<LocationBucket> = stmt
                .query_map(params![project_id, limit], |row| {
                    Ok(LocationBucket {
                        lat: row.get(0)?,
                        lon: row.get(1)?,
                        count: row.get(2)?,
                        name: None,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(buckets)
        })?;

        if let Some(geocoder) = geocoder {
            for bucket in &mut buckets {
                match geocoder.reverse(bucket.lat, bucket.lon) {
                    Ok(name) => bucket.name = name,
                    Err(e) => {
                        tracing::warn!(lat = bucket.lat, lon = bucket.lon, error = %e, "Reverse geocoding failed");
                    }
                }
            }
        }
        Ok(buckets)
    }
}
