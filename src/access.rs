use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Teacher, Role::Student, Role::Parent];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Teacher => "TEACHER",
            Role::Student => "STUDENT",
            Role::Parent => "PARENT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(t))
            .ok_or_else(|| AccessError::UnknownRole(t.to_string()))
    }
}

/// The acting user of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("begin a session first")]
    NoSession,
    #[error("{0} role required")]
    RoleRequired(Role),
    #[error("only the class teacher may change this class")]
    NotClassTeacher,
    #[error("class records are visible to the class teacher and admins only")]
    ClassRecordsHidden,
    #[error("student records not visible to this user")]
    StudentNotVisible,
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

impl AccessError {
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::NoSession => "unauthorized",
            AccessError::RoleRequired(_)
            | AccessError::NotClassTeacher
            | AccessError::ClassRecordsHidden
            | AccessError::StudentNotVisible => "forbidden",
            AccessError::UnknownRole(_) => "bad_params",
        }
    }
}

pub fn require_session(session: Option<&Principal>) -> Result<&Principal, AccessError> {
    session.ok_or(AccessError::NoSession)
}

pub fn require_role(session: Option<&Principal>, role: Role) -> Result<&Principal, AccessError> {
    let p = require_session(session)?;
    if p.role == role {
        Ok(p)
    } else {
        Err(AccessError::RoleRequired(role))
    }
}

/// Writes to a class (grades, attendance, assignments) belong to its teacher
/// alone. Admins included.
pub fn can_write_class(p: &Principal, class_teacher_id: &str) -> Result<(), AccessError> {
    match p.role {
        Role::Teacher if p.user_id == class_teacher_id => Ok(()),
        Role::Admin | Role::Teacher | Role::Student | Role::Parent => Err(AccessError::NotClassTeacher),
    }
}

/// Class-wide records (every student's grades and attendance): the class
/// teacher, or any admin.
pub fn can_read_class_records(p: &Principal, class_teacher_id: &str) -> Result<(), AccessError> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if p.user_id == class_teacher_id => Ok(()),
        Role::Teacher | Role::Student | Role::Parent => Err(AccessError::ClassRecordsHidden),
    }
}

/// Read access to one student's records.
///
/// `teaches_student` must be resolved by the caller (the teacher teaches a
/// class the student is enrolled in); `parent_ids` is the student's parent set.
pub fn can_read_student(
    p: &Principal,
    student_id: &str,
    parent_ids: &[String],
    teaches_student: bool,
) -> Result<(), AccessError> {
    let allowed = match p.role {
        Role::Admin => true,
        Role::Teacher => teaches_student,
        Role::Student => p.user_id == student_id,
        Role::Parent => parent_ids.iter().any(|id| *id == p.user_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(AccessError::StudentNotVisible)
    }
}
