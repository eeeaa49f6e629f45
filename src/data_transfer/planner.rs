use crate::error::MigrationError;
use crate::tables::MigrationTable;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub step_key: String,
    pub table: MigrationTable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn tables(&self) -> impl Iterator<Item = MigrationTable> + '_ {
        self.steps.iter().map(|step| step.table)
    }
}

/// Resolves requested table names into run order. Names are matched
/// case-insensitively and repeated names run once; `all` expands to every
/// registered table in registry order.
pub fn build_execution_plan<S: AsRef<str>>(requested: &[S]) -> Result<ExecutionPlan, MigrationError> {
    let mut tables: Vec<MigrationTable> = Vec::new();

    for name in requested {
        let name = name.as_ref().trim();
        if name.is_empty() {
            continue;
        }
        let resolved: Vec<MigrationTable> = if name.eq_ignore_ascii_case("all") {
            MigrationTable::ALL.to_vec()
        } else {
            let table = MigrationTable::from_name(name).ok_or_else(|| {
                MigrationError::Configuration(format!(
                    "Unknown table '{}'. Known tables: {}",
                    name,
                    MigrationTable::ALL
                        .iter()
                        .map(|t| t.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;
            vec![table]
        };
        for table in resolved {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }

    if tables.is_empty() {
        return Err(MigrationError::Configuration(
            "No tables requested".to_string(),
        ));
    }

    let steps = tables
        .into_iter()
        .enumerate()
        .map(|(index, table)| PlanStep {
            step_key: format!("step_{}", index + 1),
            table,
        })
        .collect();

    Ok(ExecutionPlan { steps })
}
