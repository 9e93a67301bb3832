//! Scoring with LightGBM text models (`model.txt` as written by the LightGBM CLI).

use anyhow::{anyhow, Result};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Regression,
    Binary,
}

impl Objective {
    fn from_line(objective_line: &str) -> Result<Self> {
        let name = objective_line
            .trim_start_matches("objective=")
            .split_whitespace()
            .next()
            .unwrap_or_default();
        match name {
            "regression" | "regression_l2" | "l2" | "mean_squared_error" | "mse" | "huber"
            | "regression_l1" | "l1" | "fair" => Ok(Objective::Regression),
            "binary" | "cross_entropy" | "xentropy" => Ok(Objective::Binary),
            other => Err(anyhow!("Unsupported LightGBM objective {other}")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Objective::Regression => "regression",
            Objective::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone)]
struct Tree {
    split_features: Vec<usize>,
    thresholds: Vec<f64>,
    left_child: Vec<i32>,
    right_child: Vec<i32>,
    leaf_values: Vec<f64>,
    shrinkage: f64,
}

impl Tree {
    fn from_lines(lines: &mut std::iter::Peekable<std::str::Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut split_features = Vec::new();
        let mut thresholds = Vec::new();
        let mut left_child = Vec::new();
        let mut right_child = Vec::new();
        let mut leaf_values = Vec::new();
        let mut shrinkage = 1.0;

        while let Some(peeked) = lines.peek() {
            if peeked.starts_with("Tree=") || peeked.starts_with("end of trees") {
                break;
            }
            let Some(line) = lines.next() else {
                break;
            };
            let line = line.trim();

            if line.starts_with("num_leaves=") {
                num_leaves = Some(parse_value(line, "num_leaves=")?);
            } else if line.starts_with("split_feature=") {
                split_features = parse_array(line, "split_feature=")?;
            } else if line.starts_with("threshold=") {
                thresholds = parse_array(line, "threshold=")?;
            } else if line.starts_with("left_child=") {
                left_child = parse_array(line, "left_child=")?;
            } else if line.starts_with("right_child=") {
                right_child = parse_array(line, "right_child=")?;
            } else if line.starts_with("leaf_value=") {
                leaf_values = parse_array(line, "leaf_value=")?;
            } else if line.starts_with("shrinkage=") {
                shrinkage = parse_value(line, "shrinkage=")?;
            }
        }

        let internal_nodes = split_features.len();
        if thresholds.len() != internal_nodes
            || left_child.len() != internal_nodes
            || right_child.len() != internal_nodes
        {
            return Err(anyhow!(
                "LightGBM tree definition invalid: split/child/threshold length mismatch"
            ));
        }

        let declared_leaves = num_leaves.unwrap_or(leaf_values.len());
        if declared_leaves != leaf_values.len() || leaf_values.is_empty() {
            return Err(anyhow!(
                "LightGBM tree leaf count mismatch: expected {declared_leaves}, found {}",
                leaf_values.len()
            ));
        }

        Ok(Self {
            split_features,
            thresholds,
            left_child,
            right_child,
            leaf_values,
            shrinkage,
        })
    }

    fn predict(&self, features: &[f64]) -> f64 {
        // A single-leaf tree has no internal nodes.
        if self.split_features.is_empty() {
            return self.leaf_values[0] * self.shrinkage;
        }
        let mut node_idx = 0usize;
        loop {
            let feature_idx = self.split_features[node_idx];
            let feature_value = features.get(feature_idx).copied().unwrap_or(0.0);
            let child = if feature_value <= self.thresholds[node_idx] {
                self.left_child[node_idx]
            } else {
                self.right_child[node_idx]
            };

            if child < 0 {
                let leaf_idx = (-child - 1) as usize;
                return self.leaf_values.get(leaf_idx).copied().unwrap_or_default()
                    * self.shrinkage;
            }
            node_idx = child as usize;
            if node_idx >= self.split_features.len() {
                return 0.0;
            }
        }
    }
}

/// Parsed gradient-boosted ensemble.
#[derive(Debug, Clone)]
pub struct Booster {
    trees: Vec<Tree>,
    feature_count: usize,
    feature_names: Option<Vec<String>>,
    sigmoid: f64,
    objective: Objective,
}

impl Booster {
    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut feature_names = None;
        let mut sigmoid = 1.0;
        let mut objective = None;
        let mut num_tree_per_iteration: usize = 1;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with("objective=") {
                sigmoid = extract_sigmoid(trimmed);
                objective = Some(Objective::from_line(trimmed)?);
            } else if trimmed.starts_with("num_tree_per_iteration=") {
                num_tree_per_iteration = parse_value(trimmed, "num_tree_per_iteration=")?;
            } else if trimmed.starts_with("max_feature_idx=") {
                max_feature_idx = Some(parse_value(trimmed, "max_feature_idx=")?);
            } else if let Some(names) = trimmed.strip_prefix("feature_names=") {
                feature_names = Some(names.split_whitespace().map(str::to_string).collect());
            } else if trimmed.starts_with("Tree=") {
                trees.push(Tree::from_lines(&mut lines)?);
            } else if trimmed.starts_with("end of trees") {
                break;
            }
        }

        if trees.is_empty() {
            return Err(anyhow!("LightGBM model contained no trees"));
        }
        if num_tree_per_iteration != 1 {
            return Err(anyhow!(
                "Multiclass LightGBM models are not supported (num_tree_per_iteration={num_tree_per_iteration})"
            ));
        }
        let objective =
            objective.ok_or_else(|| anyhow!("LightGBM model text has no objective line"))?;

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);

        Ok(Self {
            trees,
            feature_count,
            feature_names,
            sigmoid,
            objective,
        })
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }

    pub fn raw_score(&self, features: &[f64]) -> f64 {
        self.trees.iter().map(|tree| tree.predict(features)).sum()
    }

    /// Regression output, or the positive-class probability for binary models.
    pub fn predict(&self, features: &[f64]) -> Option<f64> {
        if features.len() < self.feature_count {
            return None;
        }
        let raw = self.raw_score(features);
        let score = match self.objective {
            Objective::Regression => raw,
            Objective::Binary => (1.0 / (1.0 + (-raw * self.sigmoid).exp())).clamp(0.0, 1.0),
        };
        score.is_finite().then_some(score)
    }
}

fn parse_value<T>(line: &str, prefix: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.trim().parse::<T>().map_err(|err| {
        anyhow!(
            "Failed to parse value for {prefix} from \"{line}\" while loading LightGBM model: {err}"
        )
    })
}

fn parse_array<T>(line: &str, prefix: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.split_whitespace()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|err| anyhow!("Failed to parse value {token} for {prefix}: {err}"))
        })
        .collect()
}

fn extract_sigmoid(objective_line: &str) -> f64 {
    objective_line
        .split_whitespace()
        .find_map(|token| token.strip_prefix("sigmoid:"))
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(1.0)
}
