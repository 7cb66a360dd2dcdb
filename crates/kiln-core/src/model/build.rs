use crate::errors::BuildError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// An ordered command list producing one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub cmd: Vec<String>,
    #[serde(deserialize_with = "output_path")]
    pub output: String,
}

impl Build {
    pub fn new(cmd: Vec<String>, output: impl Into<String>) -> Self {
        Self {
            cmd,
            output: output.into(),
        }
    }

    pub fn assign(&mut self, vars: &Placeholders) {
        for cmd in &mut self.cmd {
            *cmd = vars.apply(cmd);
        }
        self.output = vars.apply(&self.output);
    }
}

/// A named sub-merge inside a build set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostGroup {
    pub group: Vec<String>,
    pub cmd: Vec<String>,
    #[serde(deserialize_with = "output_path")]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSet {
    #[serde(rename = "Builds")]
    pub builds: BTreeMap<String, Build>,
    #[serde(rename = "Merge")]
    pub merge: Build,
    #[serde(rename = "Posts", default)]
    pub posts: BTreeMap<String, PostGroup>,
}

impl BuildSet {
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.builds.is_empty() {
            return Err(BuildError::EmptyBuildSet);
        }

        for (bid, build) in &self.builds {
            if bid.is_empty() || bid.contains(' ') {
                return Err(BuildError::InvalidId(bid.clone()));
            }
            if build.cmd.is_empty() {
                return Err(BuildError::EmptyCommands(bid.clone()));
            }
        }

        let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
        for (pid, post) in &self.posts {
            for member in &post.group {
                if !self.builds.contains_key(member) {
                    return Err(BuildError::MissingMember {
                        post: pid.clone(),
                        build: member.clone(),
                    });
                }
                if let Some(first) = owner.insert(member.as_str(), pid.as_str()) {
                    if first != pid.as_str() {
                        return Err(BuildError::DuplicateMembership {
                            build: member.clone(),
                            first: first.to_string(),
                            second: pid.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// The post group a build is a member of, if any.
    pub fn belong_to(&self, bid: &str) -> Option<&str> {
        self.posts
            .iter()
            .find(|(_, post)| post.group.iter().any(|member| member == bid))
            .map(|(pid, _)| pid.as_str())
    }
}

/// A configured job command: a single build or a whole build set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobCommand {
    Set(BuildSet),
    Single(Build),
}

impl JobCommand {
    pub fn validate(&self) -> Result<(), BuildError> {
        match self {
            Self::Set(set) => set.validate(),
            Self::Single(build) if build.cmd.is_empty() => {
                Err(BuildError::EmptyCommands(build.output.clone()))
            }
            Self::Single(_) => Ok(()),
        }
    }
}

/// Values for the `<version>` and `<datetime>` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub version: String,
    pub datetime: String,
}

impl Placeholders {
    /// Substitutes in one pass; substituted values are never rescanned.
    pub fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find('<') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let (value, len) = if tail.starts_with("<version>") {
                (self.version.as_str(), "<version>".len())
            } else if tail.starts_with("<datetime>") {
                (self.datetime.as_str(), "<datetime>".len())
            } else {
                ("<", 1)
            };
            out.push_str(value);
            rest = &tail[len..];
        }
        out.push_str(rest);
        out
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutputField {
    One(String),
    Many(Vec<String>),
}

// Outputs are written either as a path or as a list whose head is the path.
fn output_path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match OutputField::deserialize(deserializer)? {
        OutputField::One(path) => Ok(path),
        OutputField::Many(paths) => paths
            .into_iter()
            .next()
            .ok_or_else(|| serde::de::Error::custom("output list is empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET: &str = r#"
Builds:
  GL5610:
    cmd: ["make gl5610 VERSION=<version>"]
    output: ["./out/gl5610-<version>.bin"]
  GL8900:
    cmd: ["make gl8900"]
    output: "./out/gl8900.bin"
  GL8910:
    cmd: ["make gl8910"]
    output: "./out/gl8910.bin"
Merge:
  cmd: ["tar czf total-<datetime>.tgz ."]
  output: ["./total-<datetime>.tgz"]
Posts:
  P1:
    group: [GL8900, GL8910]
    cmd: ["cat gl8900.bin gl8910.bin > p1.bin"]
    output: ["./p1.bin"]
"#;

    #[test]
    fn placeholder_values_are_not_substituted_again() {
        let vars = Placeholders {
            version: "v<datetime>".to_string(),
            datetime: "20261019".to_string(),
        };
        assert_eq!(
            vars.apply("make <version> at <datetime> <other> a<b"),
            "make v<datetime> at 20261019 <other> a<b"
        );
        assert_eq!(vars.apply("no placeholders"), "no placeholders");
    }

    #[test]
    fn parses_build_set_with_both_output_forms() {
        let set: BuildSet = serde_yaml::from_str(SET).expect("parse build set");
        set.validate().expect("valid build set");

        assert_eq!(set.builds.len(), 3);
        assert_eq!(set.builds["GL8900"].output, "./out/gl8900.bin");
        assert_eq!(set.builds["GL5610"].output, "./out/gl5610-<version>.bin");
        assert_eq!(set.belong_to("GL8910"), Some("P1"));
        assert_eq!(set.belong_to("GL5610"), None);
    }

    #[test]
    fn post_member_must_exist() {
        let mut set: BuildSet = serde_yaml::from_str(SET).expect("parse build set");
        set.posts
            .get_mut("P1")
            .expect("P1")
            .group
            .push("GL9999".to_string());

        assert_eq!(
            set.validate(),
            Err(BuildError::MissingMember {
                post: "P1".to_string(),
                build: "GL9999".to_string(),
            })
        );
    }

    #[test]
    fn build_cannot_join_two_groups() {
        let mut set: BuildSet = serde_yaml::from_str(SET).expect("parse build set");
        set.posts.insert(
            "P2".to_string(),
            PostGroup {
                group: vec!["GL8900".to_string()],
                cmd: vec!["true".to_string()],
                output: "./p2.bin".to_string(),
            },
        );

        assert!(matches!(
            set.validate(),
            Err(BuildError::DuplicateMembership { .. })
        ));
    }

    #[test]
    fn job_command_distinguishes_sets_from_builds() {
        let set: JobCommand = serde_yaml::from_str(SET).expect("parse set");
        assert!(matches!(set, JobCommand::Set(_)));

        let single: JobCommand =
            serde_yaml::from_str("cmd: [\"make\"]\noutput: [\"./a.bin\"]\n").expect("parse build");
        assert_eq!(
            single,
            JobCommand::Single(Build::new(vec!["make".to_string()], "./a.bin"))
        );
    }

    #[test]
    fn placeholders_replace_every_occurrence() {
        let mut build = Build::new(
            vec!["echo <version> <datetime> <version>".to_string()],
            "./ll<version><datetime>",
        );
        build.assign(&Placeholders {
            version: "v2".to_string(),
            datetime: "20261019".to_string(),
        });

        assert_eq!(build.cmd, vec!["echo v2 20261019 v2".to_string()]);
        assert_eq!(build.output, "./llv220261019");
    }
}
