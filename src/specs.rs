use std::collections::BTreeMap;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, IgnoredAny},
    ser::SerializeMap,
};

use crate::{
    driver::{Clipping, TrainingOptions},
    optimization::{AdaBound, AdaMod, AdamP},
};

fn default_learning_rate() -> f32 {
    1e-3
}

/// Takes whatever keys the other flattened fields of a spec left over, and
/// fails if there are any.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NoUnknownKeys;

impl<'de> Deserialize<'de> for NoUnknownKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rest = BTreeMap::<String, IgnoredAny>::deserialize(deserializer)?;

        match rest.keys().next() {
            Some(key) => Err(de::Error::custom(format!("unknown option `{key}`"))),
            None => Ok(Self),
        }
    }
}

impl Serialize for NoUnknownKeys {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// The specification shared by every optimizer: a learning rate, the clipping
/// and training options and the hyperparameters of the rule, all at the same
/// level.
///
/// Every field is optional and falls back to its default. Unknown keys are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec<R> {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(flatten)]
    pub clipping: Clipping,
    #[serde(flatten)]
    pub options: TrainingOptions,
    #[serde(flatten)]
    pub rule: R,
    // Must stay the last flattened field, so it only sees the leftovers.
    #[serde(flatten)]
    unknown: NoUnknownKeys,
}

impl<R> RuleSpec<R> {
    /// Creates a new `RuleSpec` with default clipping and training options.
    pub fn new(rule: R, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            clipping: Clipping::default(),
            options: TrainingOptions::default(),
            rule,
            unknown: NoUnknownKeys,
        }
    }
}

impl<R: Default> Default for RuleSpec<R> {
    fn default() -> Self {
        Self::new(R::default(), default_learning_rate())
    }
}

/// The specification for the `AnyOptimizer` enum.
///
/// ```json
/// { "adabound": { "learning_rate": 0.001, "final_lr": 0.1, "clipnorm": 1.0, "use_ema": true } }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerSpec {
    AdaBound(RuleSpec<AdaBound>),
    AdamP(RuleSpec<AdamP>),
    AdaMod(RuleSpec<AdaMod>),
}

impl OptimizerSpec {
    /// Returns every optimizer with its default hyperparameters.
    pub fn defaults() -> [Self; 3] {
        [
            Self::AdaBound(RuleSpec::default()),
            Self::AdamP(RuleSpec::default()),
            Self::AdaMod(RuleSpec::default()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let spec: OptimizerSpec = serde_json::from_str(r#"{ "adabound": {} }"#).unwrap();
        assert_eq!(spec, OptimizerSpec::AdaBound(RuleSpec::default()));
    }

    #[test]
    fn fields_are_flat() {
        let json = r#"{
            "adamp": {
                "learning_rate": 0.01,
                "delta": 0.2,
                "nesterov": true,
                "clipvalue": 0.5
            }
        }"#;

        let OptimizerSpec::AdamP(spec) = serde_json::from_str(json).unwrap() else {
            panic!("expected an adamp spec");
        };

        assert_eq!(spec.learning_rate, 0.01);
        assert_eq!(spec.rule.delta, 0.2);
        assert!(spec.rule.nesterov);
        assert_eq!(spec.rule.wd_ratio, AdamP::default().wd_ratio);
        assert_eq!(spec.clipping.clipvalue, Some(0.5));
        assert_eq!(spec.clipping.clipnorm, None);
    }

    #[test]
    fn adamod_spec() {
        let json = r#"{ "adamod": { "beta3": 0.99, "global_clipnorm": 5 } }"#;
        let spec: OptimizerSpec = serde_json::from_str(json).unwrap();

        let rule = AdaMod {
            beta3: 0.99,
            ..Default::default()
        };
        let clipping = Clipping {
            global_clipnorm: Some(5.),
            ..Default::default()
        };
        let expected = OptimizerSpec::AdaMod(RuleSpec {
            clipping,
            ..RuleSpec::new(rule, 1e-3)
        });
        assert_eq!(spec, expected);
    }

    #[test]
    fn training_options_are_flat() {
        let json = r#"{
            "adabound": {
                "use_ema": true,
                "ema_overwrite_frequency": 10,
                "gradient_accumulation_steps": 4,
                "loss_scale_factor": 128
            }
        }"#;

        let OptimizerSpec::AdaBound(spec) = serde_json::from_str(json).unwrap() else {
            panic!("expected an adabound spec");
        };

        let expected = TrainingOptions {
            use_ema: true,
            ema_overwrite_frequency: Some(10),
            gradient_accumulation_steps: Some(4),
            loss_scale_factor: Some(128.),
            ..Default::default()
        };
        assert_eq!(spec.options, expected);
        assert_eq!(spec.rule, AdaBound::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        // `delta` belongs to adamp.
        let res = serde_json::from_str::<OptimizerSpec>(r#"{ "adabound": { "delta": 0.2 } }"#);
        let err = res.unwrap_err().to_string();
        assert!(err.contains("unknown option `delta`"), "{err}");

        let res = serde_json::from_str::<OptimizerSpec>(r#"{ "adamp": { "delta": 0.2 } }"#);
        assert!(res.is_ok());
    }

    #[test]
    fn serializes_back_to_a_flat_object() {
        let spec = OptimizerSpec::AdamP(RuleSpec::default());
        let json = serde_json::to_value(spec).unwrap();

        let fields = json["adamp"].as_object().unwrap();
        assert!(fields.contains_key("learning_rate"));
        assert!(fields.contains_key("use_ema"));
        assert!(fields.contains_key("wd_ratio"));

        let back: OptimizerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn unknown_optimizer() {
        let res = serde_json::from_str::<OptimizerSpec>(r#"{ "adam": {} }"#);
        assert!(res.is_err());
    }

    #[test]
    fn serialized_names() {
        let names: Vec<_> = OptimizerSpec::defaults()
            .iter()
            .map(|spec| {
                let json = serde_json::to_value(spec).unwrap();
                json.as_object().unwrap().keys().next().unwrap().clone()
            })
            .collect();

        assert_eq!(names, ["adabound", "adamp", "adamod"]);
    }
}
