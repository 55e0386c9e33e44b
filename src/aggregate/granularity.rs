//! Granularity descriptors for the aggregate tables.

/// What an aggregate row is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// `organisation_id` + `collection_id`
    Collection,
    /// `program_id`
    Program,
}

/// One entity key column and the SQL expression it is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    pub column: &'static str,
    pub source: &'static str,
}

/// Where a fold reads its facts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Raw link events (`e`), joined to their patterns and users (`u`).
    Events { require: Option<&'static str> },
    /// Another aggregate table (`a`) summed over a program's organisations.
    Aggregates { table: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granularity {
    pub name: &'static str,
    pub table: &'static str,
    pub scope: ScopeKind,
    pub keys: &'static [KeyColumn],
    pub source: Source,
}

const EVENTS: Source = Source::Events { require: None };

pub const LINK: Granularity = Granularity {
    name: "link",
    table: "link_aggregates",
    scope: ScopeKind::Collection,
    keys: &[],
    source: EVENTS,
};

pub const PAGE: Granularity = Granularity {
    name: "page",
    table: "page_aggregates",
    scope: ScopeKind::Collection,
    keys: &[KeyColumn {
        column: "page_name",
        source: "e.page_title",
    }],
    source: EVENTS,
};

pub const PROJECT: Granularity = Granularity {
    name: "project",
    table: "project_aggregates",
    scope: ScopeKind::Collection,
    keys: &[KeyColumn {
        column: "project_name",
        source: "e.domain",
    }],
    source: EVENTS,
};

pub const USER: Granularity = Granularity {
    name: "user",
    table: "user_aggregates",
    scope: ScopeKind::Collection,
    keys: &[KeyColumn {
        column: "username",
        source: "u.username",
    }],
    source: Source::Events {
        require: Some("u.username IS NOT NULL"),
    },
};

pub const PAGE_PROJECT: Granularity = Granularity {
    name: "pageproject",
    table: "pageproject_aggregates",
    scope: ScopeKind::Collection,
    keys: &[
        KeyColumn {
            column: "page_name",
            source: "e.page_title",
        },
        KeyColumn {
            column: "project_name",
            source: "e.domain",
        },
    ],
    source: EVENTS,
};

pub const PROGRAM_TOP_USERS: Granularity = Granularity {
    name: "program top users",
    table: "program_top_users",
    scope: ScopeKind::Program,
    keys: &[KeyColumn {
        column: "username",
        source: "a.username",
    }],
    source: Source::Aggregates {
        table: "user_aggregates",
    },
};

pub const PROGRAM_TOP_PROJECTS: Granularity = Granularity {
    name: "program top projects",
    table: "program_top_projects",
    scope: ScopeKind::Program,
    keys: &[KeyColumn {
        column: "project_name",
        source: "a.project_name",
    }],
    source: Source::Aggregates {
        table: "pageproject_aggregates",
    },
};

pub const PROGRAM_TOP_ORGANISATIONS: Granularity = Granularity {
    name: "program top organisations",
    table: "program_top_organisations",
    scope: ScopeKind::Program,
    keys: &[KeyColumn {
        column: "organisation_id",
        source: "a.organisation_id",
    }],
    source: Source::Aggregates {
        table: "link_aggregates",
    },
};

/// Per-collection folds, in the order `aggregate-all` runs them.
pub const COLLECTION_FOLDS: [Granularity; 5] = [LINK, PAGE, PROJECT, USER, PAGE_PROJECT];

/// Program folds; they read the per-collection tables and run after them.
pub const PROGRAM_FOLDS: [Granularity; 3] =
    [PROGRAM_TOP_USERS, PROGRAM_TOP_PROJECTS, PROGRAM_TOP_ORGANISATIONS];

/// Tables that must be populated before raw events may be archived.
pub const ARCHIVE_GATES: [Granularity; 3] = [LINK, USER, PAGE_PROJECT];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_folds_read_collection_tables() {
        let collection_tables: Vec<_> = COLLECTION_FOLDS.iter().map(|g| g.table).collect();
        for fold in PROGRAM_FOLDS {
            match fold.source {
                Source::Aggregates { table } => assert!(collection_tables.contains(&table)),
                Source::Events { .. } => panic!("{} reads raw events", fold.name),
            }
            assert_eq!(fold.scope, ScopeKind::Program);
        }
    }
}
