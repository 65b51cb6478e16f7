//! 查询引擎
//!
//! 把一组标签约束翻译为索引查找：标识符约束下推为SQL查询，
//! 主标签约束在候选集上复核，未索引标签回退为读取实例JSON摘要。

use std::collections::{BTreeMap, BTreeSet};

use litepacs_core::dicom::{identifier_tags_for_level, level_of_tag, DicomMap, DicomTag};
use litepacs_core::utils::normalize_identifier;
use litepacs_core::{ContentType, ResourceLevel, Result, StoreError};
use litepacs_index::IndexTransaction;
use litepacs_storage::StorageAccessor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 约束类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// 精确匹配
    Exact(String),
    /// 通配匹配，'*'与'?'
    Wildcard(String),
    /// 闭区间范围（日期、时间按字典序）
    Range {
        lower: Option<String>,
        upper: Option<String>,
    },
    /// 集合成员
    List(Vec<String>),
}

/// 单个标签约束
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConstraint {
    pub tag: DicomTag,
    pub kind: ConstraintKind,
}

/// 结构化查询：目标层级加一组约束
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuery {
    pub level: ResourceLevel,
    pub constraints: Vec<TagConstraint>,
    /// 结果数上限，0表示使用配置默认值
    #[serde(default)]
    pub max_results: u32,
}

/// 查询路径上限
#[derive(Debug, Clone, Copy)]
pub struct FindLimits {
    /// 优化路径结果数上限，0表示不限制
    pub max_results: u32,
    /// 非优化路径扫描的实例数上限，0表示不限制
    pub max_scanned_instances: u32,
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| StoreError::Internal(format!("通配符编译失败: {}", e)))
}

enum CompiledKind {
    Exact(String),
    Wildcard(Regex),
    Range {
        lower: Option<String>,
        upper: Option<String>,
    },
    List(Vec<String>),
}

struct CompiledConstraint {
    tag: DicomTag,
    level: Option<ResourceLevel>,
    is_identifier: bool,
    kind: CompiledKind,
    /// 标识符路径使用规范化形式的约束
    normalized: CompiledKind,
}

impl CompiledConstraint {
    fn compile(constraint: &TagConstraint) -> Result<Self> {
        let level = level_of_tag(constraint.tag);
        let is_identifier = level
            .map(|l| identifier_tags_for_level(l).contains(&constraint.tag))
            .unwrap_or(false);

        let compile_kind = |normalize: bool| -> Result<CompiledKind> {
            let norm = |s: &str| {
                if normalize {
                    normalize_identifier(s)
                } else {
                    s.to_string()
                }
            };
            Ok(match &constraint.kind {
                ConstraintKind::Exact(v) => CompiledKind::Exact(norm(v)),
                ConstraintKind::Wildcard(p) => CompiledKind::Wildcard(glob_to_regex(&norm(p))?),
                ConstraintKind::Range { lower, upper } => CompiledKind::Range {
                    lower: lower.as_deref().map(&norm),
                    upper: upper.as_deref().map(&norm),
                },
                ConstraintKind::List(values) => {
                    CompiledKind::List(values.iter().map(|v| norm(v)).collect())
                }
            })
        };

        Ok(Self {
            tag: constraint.tag,
            level,
            is_identifier,
            kind: compile_kind(false)?,
            normalized: compile_kind(true)?,
        })
    }

    /// 主标签原文匹配
    fn matches_raw(&self, value: &str) -> bool {
        Self::matches_kind(&self.kind, value)
    }

    /// 标识符规范化值匹配
    fn matches_normalized(&self, value: &str) -> bool {
        Self::matches_kind(&self.normalized, value)
    }

    fn matches_kind(kind: &CompiledKind, value: &str) -> bool {
        match kind {
            CompiledKind::Exact(expected) => value == expected,
            CompiledKind::Wildcard(regex) => regex.is_match(value),
            CompiledKind::Range { lower, upper } => {
                lower.as_deref().map_or(true, |l| value >= l)
                    && upper.as_deref().map_or(true, |u| value <= u)
            }
            CompiledKind::List(values) => values.iter().any(|v| v == value),
        }
    }
}

const LEVELS: [ResourceLevel; 4] = [
    ResourceLevel::Patient,
    ResourceLevel::Study,
    ResourceLevel::Series,
    ResourceLevel::Instance,
];

/// 标识符约束下推为索引查找
async fn identifier_candidates(
    tx: &mut IndexTransaction<'_>,
    constraint: &CompiledConstraint,
    level: ResourceLevel,
) -> Result<BTreeSet<i64>> {
    let ids = match &constraint.normalized {
        CompiledKind::Exact(value) => {
            tx.lookup_identifier_exact(constraint.tag, value, level).await?
        }
        CompiledKind::Range { lower, upper } => {
            tx.lookup_identifier_range(constraint.tag, lower.as_deref(), upper.as_deref(), level)
                .await?
        }
        CompiledKind::List(values) => {
            let mut result = Vec::new();
            for value in values {
                result.extend(tx.lookup_identifier_exact(constraint.tag, value, level).await?);
            }
            result
        }
        CompiledKind::Wildcard(_) => tx
            .identifier_values(constraint.tag, level)
            .await?
            .into_iter()
            .filter(|(_, value)| constraint.matches_normalized(value))
            .map(|(id, _)| id)
            .collect(),
    };
    Ok(ids.into_iter().collect())
}

/// 在候选集上复核主标签约束
async fn filter_by_main_tags(
    tx: &mut IndexTransaction<'_>,
    candidates: BTreeSet<i64>,
    constraints: &[&CompiledConstraint],
) -> Result<BTreeSet<i64>> {
    if constraints.is_empty() {
        return Ok(candidates);
    }

    let mut result = BTreeSet::new();
    for id in candidates {
        let tags = tx.get_main_dicom_tags(id).await?;
        let matches = constraints.iter().all(|c| {
            tags.get(c.tag).map_or(false, |value| c.matches_raw(value))
        });
        if matches {
            result.insert(id);
        }
    }
    Ok(result)
}

/// 在某一层级施加全部约束
async fn apply_level_constraints(
    tx: &mut IndexTransaction<'_>,
    mut candidates: BTreeSet<i64>,
    constraints: &[&CompiledConstraint],
    level: ResourceLevel,
) -> Result<BTreeSet<i64>> {
    let mut main_only = Vec::new();
    for constraint in constraints {
        if constraint.is_identifier {
            let pushed = identifier_candidates(tx, constraint, level).await?;
            candidates = candidates.intersection(&pushed).copied().collect();
            if candidates.is_empty() {
                return Ok(candidates);
            }
        } else {
            main_only.push(*constraint);
        }
    }
    filter_by_main_tags(tx, candidates, &main_only).await
}

/// 执行查询，返回目标层级的公共标识符（无序）
pub async fn execute_find(
    tx: &mut IndexTransaction<'_>,
    accessor: &StorageAccessor,
    query: &FindQuery,
    limits: FindLimits,
) -> Result<Vec<String>> {
    let mut compiled = Vec::with_capacity(query.constraints.len());
    for constraint in &query.constraints {
        compiled.push(CompiledConstraint::compile(constraint)?);
    }

    let mut by_level: BTreeMap<ResourceLevel, Vec<&CompiledConstraint>> = BTreeMap::new();
    let mut unindexed: Vec<&CompiledConstraint> = Vec::new();
    for constraint in &compiled {
        match constraint.level {
            Some(level) => by_level.entry(level).or_default().push(constraint),
            None => unindexed.push(constraint),
        }
    }

    let start = by_level
        .keys()
        .next()
        .copied()
        .unwrap_or(query.level)
        .min(query.level);
    let mut deepest = by_level.keys().last().copied().unwrap_or(query.level).max(query.level);
    if !unindexed.is_empty() {
        // 未索引标签只能在实例JSON摘要中匹配
        deepest = ResourceLevel::Instance;
    }

    // 起始层级候选集
    let mut candidates: BTreeSet<i64> = tx.list_level_ids(start).await?.into_iter().collect();
    if let Some(constraints) = by_level.get(&start) {
        candidates = apply_level_constraints(tx, candidates, constraints, start).await?;
    }

    // 逐层向下展开
    let mut level = start;
    while level < deepest && !candidates.is_empty() {
        level = level.child().expect("deepest never exceeds Instance");
        let mut expanded = BTreeSet::new();
        for id in &candidates {
            expanded.extend(tx.get_children(*id).await?);
        }
        candidates = expanded;
        if let Some(constraints) = by_level.get(&level) {
            candidates = apply_level_constraints(tx, candidates, constraints, level).await?;
        }
    }

    // 非优化路径：读取实例JSON摘要匹配未索引标签
    if !unindexed.is_empty() && !candidates.is_empty() {
        let mut matched = BTreeSet::new();
        let mut scanned = 0u32;
        for id in &candidates {
            if limits.max_scanned_instances > 0 && scanned >= limits.max_scanned_instances {
                debug!("Unoptimized find aborted after scanning {} instances", scanned);
                break;
            }
            scanned += 1;

            let Some(info) = tx.lookup_attachment(*id, ContentType::DicomAsJson).await? else {
                continue;
            };
            let bytes = accessor.read(&info).await?;
            let summary: serde_json::Value = serde_json::from_slice(&bytes)?;
            let tags = DicomMap::from_json(&summary)?;

            let matches = unindexed
                .iter()
                .all(|c| tags.get(c.tag).map_or(false, |value| c.matches_raw(value)));
            if matches {
                matched.insert(*id);
                if query.level == ResourceLevel::Instance
                    && query.max_results > 0
                    && matched.len() as u32 >= query.max_results
                {
                    break;
                }
            }
        }
        candidates = matched;
    }

    // 目标层级高于当前层级时沿父链回溯
    while level > query.level {
        level = level.parent().expect("walked below Patient");
        let mut ascended = BTreeSet::new();
        for id in &candidates {
            if let Some(parent) = tx.get_parent(*id).await? {
                ascended.insert(parent);
            }
        }
        candidates = ascended;
    }

    let cap = match (query.max_results, limits.max_results) {
        (0, 0) => usize::MAX,
        (0, l) => l as usize,
        (q, 0) => q as usize,
        (q, l) => q.min(l) as usize,
    };

    let mut result = Vec::with_capacity(candidates.len().min(cap));
    for id in candidates {
        if result.len() >= cap {
            break;
        }
        result.push(tx.get_public_id(id).await?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use litepacs_core::dicom::{
        DicomTag, TAG_MODALITY, TAG_PATIENT_ID, TAG_STUDY_DATE, TAG_STUDY_INSTANCE_UID,
    };
    use litepacs_index::IndexDatabase;
    use litepacs_storage::FilesystemStorage;

    const NO_LIMITS: FindLimits = FindLimits {
        max_results: 0,
        max_scanned_instances: 0,
    };

    struct Fixture {
        db: IndexDatabase,
        accessor: StorageAccessor,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        Fixture {
            db: IndexDatabase::open(":memory:").await.unwrap(),
            accessor: StorageAccessor::new(storage, false, false),
            _dir: dir,
        }
    }

    /// 建立 patient -> study -> series -> instance 四层并登记标签
    async fn seed(
        fx: &Fixture,
        patient: &str,
        study_uid: &str,
        study_date: &str,
        modality: &str,
    ) -> (String, String) {
        let mut tx = fx.db.transaction().await.unwrap();

        let patient_public = format!("patient-{}", patient);
        let patient_id = match tx.lookup_resource(&patient_public).await.unwrap() {
            Some((id, _)) => id,
            None => {
                let id = tx
                    .create_resource(&patient_public, ResourceLevel::Patient)
                    .await
                    .unwrap();
                let mut tags = DicomMap::new();
                tags.set(TAG_PATIENT_ID, patient);
                tx.set_main_dicom_tags(id, &tags).await.unwrap();
                tx.register_identifiers(id, ResourceLevel::Patient, &tags).await.unwrap();
                id
            }
        };

        let study_public = format!("study-{}", study_uid);
        let study_id = tx
            .create_resource(&study_public, ResourceLevel::Study)
            .await
            .unwrap();
        let mut tags = DicomMap::new();
        tags.set(TAG_STUDY_INSTANCE_UID, study_uid);
        tags.set(TAG_STUDY_DATE, study_date);
        tags.set(TAG_PATIENT_ID, patient);
        tx.set_main_dicom_tags(study_id, &tags).await.unwrap();
        tx.register_identifiers(study_id, ResourceLevel::Study, &tags).await.unwrap();
        tx.attach_child(patient_id, study_id).await.unwrap();

        let series_public = format!("series-{}", study_uid);
        let series_id = tx
            .create_resource(&series_public, ResourceLevel::Series)
            .await
            .unwrap();
        let mut tags = DicomMap::new();
        tags.set(TAG_MODALITY, modality);
        tx.set_main_dicom_tags(series_id, &tags).await.unwrap();
        tx.attach_child(study_id, series_id).await.unwrap();

        let instance_public = format!("instance-{}", study_uid);
        let instance_id = tx
            .create_resource(&instance_public, ResourceLevel::Instance)
            .await
            .unwrap();
        tx.attach_child(series_id, instance_id).await.unwrap();

        tx.commit().await.unwrap();
        (study_public, instance_public)
    }

    #[tokio::test]
    async fn test_exact_identifier_at_study_level() {
        let fx = fixture().await;
        seed(&fx, "P1", "1.2.3", "20230101", "CT").await;
        let (expected, _) = seed(&fx, "P1", "1.2.9", "20230601", "MR").await;

        let query = FindQuery {
            level: ResourceLevel::Study,
            constraints: vec![TagConstraint {
                tag: TAG_STUDY_INSTANCE_UID,
                kind: ConstraintKind::Exact("1.2.9".to_string()),
            }],
            max_results: 0,
        };

        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result, vec![expected]);
    }

    #[tokio::test]
    async fn test_wildcard_and_range() {
        let fx = fixture().await;
        seed(&fx, "P1", "1.2.3", "20230101", "CT").await;
        seed(&fx, "P2", "5.6.7", "20231224", "MR").await;

        // 通配：患者层级
        let query = FindQuery {
            level: ResourceLevel::Patient,
            constraints: vec![TagConstraint {
                tag: TAG_PATIENT_ID,
                kind: ConstraintKind::Wildcard("P*".to_string()),
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result.len(), 2);
        drop(tx);

        // 范围：检查日期（主标签路径）
        let query = FindQuery {
            level: ResourceLevel::Study,
            constraints: vec![TagConstraint {
                tag: TAG_STUDY_DATE,
                kind: ConstraintKind::Range {
                    lower: Some("20231001".to_string()),
                    upper: None,
                },
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result, vec!["study-5.6.7".to_string()]);
    }

    #[tokio::test]
    async fn test_walk_down_to_target_level() {
        let fx = fixture().await;
        let (_, instance) = seed(&fx, "P1", "1.2.3", "20230101", "CT").await;
        seed(&fx, "P2", "5.6.7", "20231224", "MR").await;

        // 患者层级约束，实例层级目标
        let query = FindQuery {
            level: ResourceLevel::Instance,
            constraints: vec![TagConstraint {
                tag: TAG_PATIENT_ID,
                kind: ConstraintKind::Exact("P1".to_string()),
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result, vec![instance]);
    }

    #[tokio::test]
    async fn test_constraint_below_target_ascends() {
        let fx = fixture().await;
        seed(&fx, "P1", "1.2.3", "20230101", "CT").await;
        seed(&fx, "P2", "5.6.7", "20231224", "MR").await;

        // 系列层级约束，检查层级目标
        let query = FindQuery {
            level: ResourceLevel::Study,
            constraints: vec![TagConstraint {
                tag: TAG_MODALITY,
                kind: ConstraintKind::Exact("MR".to_string()),
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result, vec!["study-5.6.7".to_string()]);
    }

    #[tokio::test]
    async fn test_unindexed_tag_via_json_summary() {
        let fx = fixture().await;
        let (_, instance_public) = seed(&fx, "P1", "1.2.3", "20230101", "CT").await;

        // 给实例挂一个包含未索引标签的JSON摘要
        let body_part = DicomTag::new(0x0008, 0x0080);
        let mut tags = DicomMap::new();
        tags.set(body_part, "General Hospital");
        let bytes = serde_json::to_vec(&tags.to_json()).unwrap();
        let info = fx
            .accessor
            .write(&bytes, ContentType::DicomAsJson)
            .await
            .unwrap();

        let mut tx = fx.db.transaction().await.unwrap();
        let (id, _) = tx.lookup_resource(&instance_public).await.unwrap().unwrap();
        tx.add_attachment(id, &info).await.unwrap();
        tx.commit().await.unwrap();

        let query = FindQuery {
            level: ResourceLevel::Instance,
            constraints: vec![TagConstraint {
                tag: body_part,
                kind: ConstraintKind::Wildcard("General*".to_string()),
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result, vec![instance_public]);
    }

    #[tokio::test]
    async fn test_max_results_cap() {
        let fx = fixture().await;
        for i in 0..5 {
            seed(&fx, &format!("P{}", i), &format!("1.2.{}", i), "20230101", "CT").await;
        }

        let query = FindQuery {
            level: ResourceLevel::Patient,
            constraints: vec![TagConstraint {
                tag: TAG_PATIENT_ID,
                kind: ConstraintKind::Wildcard("P*".to_string()),
            }],
            max_results: 2,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_list_membership() {
        let fx = fixture().await;
        seed(&fx, "P1", "1.2.3", "20230101", "CT").await;
        seed(&fx, "P2", "5.6.7", "20231224", "MR").await;
        seed(&fx, "P3", "8.9.1", "20240301", "US").await;

        let query = FindQuery {
            level: ResourceLevel::Patient,
            constraints: vec![TagConstraint {
                tag: TAG_PATIENT_ID,
                kind: ConstraintKind::List(vec!["P1".to_string(), "P3".to_string()]),
            }],
            max_results: 0,
        };
        let mut tx = fx.db.transaction().await.unwrap();
        let result = execute_find(&mut tx, &fx.accessor, &query, NO_LIMITS).await.unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.contains(&"patient-P1".to_string()));
        assert!(result.contains(&"patient-P3".to_string()));
    }
}
