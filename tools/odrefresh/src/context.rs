//! Class loader contexts for system server jars.
//!
//! A jar's context lists everything loaded before it: the classpath jars seen
//! so far as one parent group and the standalone jars seen so far as sibling
//! groups. Contexts are immutable values; walking the jar list folds one
//! forward, so jars that are not compiled still shape the context of later ones.

use std::fmt;

/// Jars loaded before some system server jar.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassLoaderContext {
    classpath: Vec<String>,
    standalone: Vec<String>,
}

impl ClassLoaderContext {
    /// Context of the first jar: nothing loaded yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The context seen by the jar after `jar`.
    #[must_use]
    pub fn with_jar(&self, jar: &str, in_classpath: bool) -> Self {
        let mut next = self.clone();
        if in_classpath {
            next.classpath.push(jar.to_string());
        } else {
            next.standalone.push(jar.to_string());
        }
        next
    }

    /// Every jar named by the context, classpath first.
    pub fn jars(&self) -> impl Iterator<Item = &str> {
        self.classpath.iter().chain(&self.standalone).map(String::as_str)
    }

    /// The `--class-loader-context` value for a jar loaded in this context.
    ///
    /// Standalone jars get their own empty loader in front of the shared one.
    pub fn encode(&self, in_classpath: bool) -> String {
        if in_classpath {
            self.to_string()
        } else {
            format!("PCL[];{self}")
        }
    }
}

impl fmt::Display for ClassLoaderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PCL[{}]", self.classpath.join(":"))?;
        if !self.standalone.is_empty() {
            let siblings: Vec<String> = self.standalone.iter().map(|j| format!("PCL[{j}]")).collect();
            write!(f, "{{{}}}", siblings.join("#"))?;
        }
        Ok(())
    }
}

/// One system server jar paired with the context it is compiled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JarContext {
    /// Classpath location of the jar.
    pub jar: String,
    /// `true` for the linear classpath.
    pub in_classpath: bool,
    /// Jars loaded before it.
    pub context: ClassLoaderContext,
}

/// Pair every jar with its context, in load order.
pub fn plan<'a>(jars: impl IntoIterator<Item = (&'a str, bool)>) -> Vec<JarContext> {
    let (planned, _) = jars.into_iter().fold(
        (Vec::new(), ClassLoaderContext::empty()),
        |(mut planned, context), (jar, in_classpath)| {
            let next = context.with_jar(jar, in_classpath);
            planned.push(JarContext {
                jar: jar.to_string(),
                in_classpath,
                context,
            });
            (planned, next)
        },
    );
    planned
}
