use serde::{Deserialize, Serialize};

/// A movie as published by a remote catalog. `url` is the stable remote key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub runtime: Option<i32>,
    #[serde(default)]
    pub director: Option<String>,
    #[serde(default)]
    pub cast: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    /// Milliseconds since epoch. Defaults to merge time when absent.
    #[serde(default)]
    pub date_added: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub backdrop_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub total_seasons: i32,
    #[serde(default)]
    pub total_episodes: i32,
    #[serde(default)]
    pub cast: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub date_added: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
}

/// An episode. `series_url` links it to its [`Series`] by remote key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub url: String,
    pub series_url: String,
    #[serde(default)]
    pub series_title: Option<String>,
    pub season: i32,
    pub episode: i32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub air_date: Option<String>,
    #[serde(default)]
    pub runtime: Option<i32>,
    #[serde(default)]
    pub date_added: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub slug: String,
    pub name: String,
}

/// Everything a fetcher returns for one source in one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub movies: Vec<Movie>,
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
    #[serde(default)]
    pub genres: Vec<Genre>,
}

impl CatalogSnapshot {
    pub fn len(&self) -> usize {
        self.movies.len() + self.series.len() + self.episodes.len() + self.genres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind of content a piece of user state points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Movie,
    Series,
    Episode,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
            Self::Episode => "episode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(Self::Movie),
            "series" => Some(Self::Series),
            "episode" => Some(Self::Episode),
            _ => None,
        }
    }
}

/// Counts produced by one upsert merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub movies_inserted: usize,
    pub movies_updated: usize,
    pub series_inserted: usize,
    pub series_updated: usize,
    pub episodes_inserted: usize,
    pub episodes_updated: usize,
    pub genres_upserted: usize,
    /// Episodes left out because their series is unknown locally.
    pub episodes_skipped: usize,
}

impl MergeStats {
    /// Titles (movies + series) that did not exist locally before this merge.
    pub fn new_titles(&self) -> usize {
        self.movies_inserted + self.series_inserted
    }

    pub fn total(&self) -> usize {
        self.movies_inserted
            + self.movies_updated
            + self.series_inserted
            + self.series_updated
            + self.episodes_inserted
            + self.episodes_updated
            + self.genres_upserted
    }

    pub fn has_new_content(&self) -> bool {
        self.new_titles() > 0 || self.episodes_inserted > 0
    }

    /// Get a summary string of what was merged
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if self.movies_inserted > 0 {
            parts.push(format!("{} new movies", self.movies_inserted));
        }
        if self.series_inserted > 0 {
            parts.push(format!("{} new series", self.series_inserted));
        }
        if self.episodes_inserted > 0 {
            parts.push(format!("{} new episodes", self.episodes_inserted));
        }
        let updated = self.movies_updated + self.series_updated + self.episodes_updated;
        if updated > 0 {
            parts.push(format!("{} updated", updated));
        }
        if self.episodes_skipped > 0 {
            parts.push(format!("{} episodes skipped", self.episodes_skipped));
        }

        if parts.is_empty() {
            "No changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}
